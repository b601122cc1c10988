use thiserror::Error;

use crate::transfer::governor::Deny;

/// Centralized error types for the engine
///
/// All errors crossing the orchestrator boundary are converted to this enum
/// for consistent handling. Uses `thiserror` for automatic conversion and
/// display formatting.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Admission rejected by the governor
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(Deny),

    /// Unknown transfer id
    #[error("Transfer not found: {0}")]
    NotFound(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Database connection pool errors
    #[error("Database pool error: {0}")]
    DatabasePool(#[from] r2d2::Error),

    /// IO errors (partial files, staged uploads)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation errors (bad submit parameters)
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Type alias for Result with EngineError
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// True when the error should be reported to the requester verbatim
    /// (admission/lookup problems) rather than logged as an internal fault.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            EngineError::QuotaExceeded(_) | EngineError::NotFound(_) | EngineError::Validation(_)
        )
    }
}
