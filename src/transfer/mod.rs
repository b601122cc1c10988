//! Transfer orchestration: scheduling, budgets, chunked streaming,
//! crash-safe resume

pub mod governor;
pub mod notify;
pub mod orchestrator;
pub mod queue;
pub mod transport;
pub mod types;
pub mod worker;

use std::path::PathBuf;
use std::time::Duration;

use crate::core::config;
use crate::core::retry::RetryConfig;
use governor::GovernorLimits;

// Re-exports for convenience
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::Orchestrator;
pub use transport::{Transport, TransportError, TransportStream};
pub use types::{Direction, NewTransfer, Transfer, TransferState};

/// Tunables for one engine instance.
///
/// Defaults come from the environment-backed constants in
/// [`crate::core::config`]; tests and embedders override through the
/// setters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent worker slots
    pub pool_size: usize,
    /// Bytes per streamed chunk
    pub chunk_size: usize,
    /// Backoff curve and attempt ceiling for recoverable failures
    pub retry: RetryConfig,
    /// Governor admission limits
    pub limits: GovernorLimits,
    /// Area for partial and completed download artifacts
    pub downloads_dir: PathBuf,
    /// Keep completed download artifacts after notification (the embedding
    /// adapter deletes them after delivery when false)
    pub keep_completed_artifacts: bool,
    /// Dispatcher poll interval
    pub queue_check_interval: Duration,
    /// Cadence of the paused-transfer budget re-check
    pub budget_recheck_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: config::pool::MAX_WORKERS,
            chunk_size: config::chunk::CHUNK_SIZE_BYTES,
            retry: RetryConfig::network(),
            limits: GovernorLimits::default(),
            downloads_dir: PathBuf::from(config::expand_path(&config::DOWNLOAD_FOLDER)),
            keep_completed_artifacts: true,
            queue_check_interval: config::pool::check_interval(),
            budget_recheck_interval: config::budget::recheck_interval(),
        }
    }
}

impl EngineConfig {
    /// Creates a config with environment defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the chunk size.
    #[must_use]
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the governor limits.
    #[must_use]
    pub fn limits(mut self, limits: GovernorLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Sets the downloads area.
    #[must_use]
    pub fn downloads_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.downloads_dir = dir.into();
        self
    }

    /// Sets whether completed download artifacts outlive their notification.
    #[must_use]
    pub fn keep_completed_artifacts(mut self, keep: bool) -> Self {
        self.keep_completed_artifacts = keep;
        self
    }

    /// Sets the dispatcher poll interval.
    #[must_use]
    pub fn queue_check_interval(mut self, interval: Duration) -> Self {
        self.queue_check_interval = interval;
        self
    }

    /// Sets the paused-transfer re-check cadence.
    #[must_use]
    pub fn budget_recheck_interval(mut self, interval: Duration) -> Self {
        self.budget_recheck_interval = interval;
        self
    }
}
