use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Configuration constants for the transfer engine
/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: data/megaferry.sqlite
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "data/megaferry.sqlite".to_string()));

/// Downloads area for partial and completed transfer artifacts
/// Read from DOWNLOAD_FOLDER environment variable
/// Supports tilde (~) expansion for home directory
pub static DOWNLOAD_FOLDER: Lazy<String> =
    Lazy::new(|| env::var("DOWNLOAD_FOLDER").unwrap_or_else(|_| "downloads".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: logs/megaferry.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/megaferry.log".to_string()));

/// Expands `~` in a configured path.
pub fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

/// Worker pool configuration
pub mod pool {
    use super::Duration;

    /// Number of concurrent transfer slots.
    /// Kept small: each slot is a live network stream plus a disk writer.
    pub const MAX_WORKERS: usize = 4;

    /// Interval between dispatch-queue checks (in milliseconds)
    pub const CHECK_INTERVAL_MS: u64 = 100;

    /// Queue check interval duration
    pub fn check_interval() -> Duration {
        Duration::from_millis(CHECK_INTERVAL_MS)
    }
}

/// Chunked streaming configuration
pub mod chunk {
    /// Bytes moved per chunk; also the unit of progress persistence and
    /// the granularity of cancellation.
    pub const CHUNK_SIZE_BYTES: usize = 2 * 1024 * 1024;
}

/// Admission limits enforced by the governor
pub mod limits {
    use super::Duration;

    /// Maximum non-terminal transfers a single owner may hold
    pub const PER_OWNER_MAX_ACTIVE: usize = 3;

    /// Sliding window for submission rate limiting (in seconds)
    pub const RATE_WINDOW_SECS: u64 = 60;

    /// Maximum submissions per owner inside the sliding window
    pub const RATE_MAX_SUBMITS: usize = 10;

    /// Global disk budget for the downloads area (20 GiB)
    pub const DISK_BUDGET_BYTES: u64 = 20 * 1024 * 1024 * 1024;

    /// Conservative reservation for transfers of unknown size (2 GiB,
    /// the Telegram bot-file horizon)
    pub const DEFAULT_RESERVATION_BYTES: u64 = 2 * 1024 * 1024 * 1024;

    /// Rate window duration
    pub fn rate_window() -> Duration {
        Duration::from_secs(RATE_WINDOW_SECS)
    }
}

/// Retry configuration
pub mod retry {
    /// Attempt ceiling shared by transient failures and crash resumes;
    /// a transfer that keeps failing terminates as failed once reached.
    pub const MAX_ATTEMPTS: u32 = 5;
}

/// Paused-transfer budget re-check configuration
pub mod budget {
    use super::Duration;

    /// Interval between checks for freed disk budget (in seconds).
    /// Paused transfers are re-queued on this cadence, never faster.
    pub const RECHECK_INTERVAL_SECS: u64 = 15;

    /// Re-check interval duration
    pub fn recheck_interval() -> Duration {
        Duration::from_secs(RECHECK_INTERVAL_SECS)
    }
}
