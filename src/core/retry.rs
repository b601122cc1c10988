//! Retry policy for failed transfers.
//!
//! Transfers are not retried in place: a recoverable failure sends the
//! transfer back to the dispatch queue with an eligibility delay computed
//! here (exponential backoff with jitter, capped). The attempt ceiling
//! lives in the engine configuration; this module owns the delay curve and
//! the retryable/non-retryable classification seam.

use std::time::Duration;

/// Retry strategy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_attempts: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::core::config::retry::MAX_ATTEMPTS,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt ceiling.
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn no_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the re-queue delay for a given attempt number
    /// (0 = delay after the first failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.add_jitter {
            // Up to 25% jitter so simultaneous failures don't re-queue in lockstep
            let jitter = rand::random::<f64>() * 0.25 * capped_delay;
            capped_delay + jitter
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Predefined retry configs.
impl RetryConfig {
    /// Config for network transfers (more headroom, longer delays).
    pub fn network() -> Self {
        Self {
            max_attempts: crate::core::config::retry::MAX_ATTEMPTS,
            initial_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Config for quick retries in tests and local transports.
    pub fn quick() -> Self {
        Self {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            add_jitter: false,
        }
    }
}

/// Determines if an error is retryable.
///
/// The classification, not the raw error, drives the retry policy: a
/// transport reports `Transient` vs `AuthFailure`/`NotFound`, and the
/// worker only re-queues when this returns true.
pub trait Retryable {
    /// Returns true if the error should be retried.
    fn is_retryable(&self) -> bool;

    /// Returns an optional hint for retry delay (e.g., from rate limit headers).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl Retryable for std::io::Error {
    fn is_retryable(&self) -> bool {
        use std::io::ErrorKind;
        matches!(
            self.kind(),
            ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
        )
    }
}
