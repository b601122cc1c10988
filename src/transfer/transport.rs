//! Chunked transport seam.
//!
//! The engine never speaks a provider protocol itself. Both networks
//! (storage provider, chat platform) are reached through this uniform
//! streaming interface: open at an offset, move bounded chunks, close.
//! The error *classification*, not the raw error, is what drives the
//! retry policy in the worker.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::core::retry::Retryable;
use crate::transfer::types::Direction;

/// Transport failure classification.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Source locator does not resolve to anything; no retry
    #[error("Source not found: {0}")]
    NotFound(String),

    /// Credentials or permissions rejected by the provider; no retry
    #[error("Authorization failure: {0}")]
    AuthFailure(String),

    /// Timeout, dropped connection, provider hiccup; retryable
    #[error("Transient transport error: {0}")]
    Transient(String),
}

impl TransportError {
    /// Short classification tag persisted as the transfer's `last_error`.
    pub fn classification(&self) -> &'static str {
        match self {
            TransportError::NotFound(_) => "not_found",
            TransportError::AuthFailure(_) => "auth_failure",
            TransportError::Transient(_) => "transient",
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Factory side of the seam: one per provider integration.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a stream for `source`.
    ///
    /// `resume_offset` asks the provider to continue from a prior partial
    /// transfer; a provider that cannot resume returns a stream whose
    /// `resumed_from()` is 0, and the worker restarts from scratch.
    async fn open(
        &self,
        source: &str,
        direction: Direction,
        resume_offset: u64,
    ) -> Result<Box<dyn TransportStream>, TransportError>;
}

/// One open streaming handle, held exclusively by a worker slot.
#[async_trait]
pub trait TransportStream: Send {
    /// Total size as reported by the provider, if it knows.
    fn total_bytes(&self) -> Option<u64>;

    /// Offset the stream actually starts at. Equal to the requested
    /// resume offset when the provider honoured it, 0 otherwise.
    fn resumed_from(&self) -> u64;

    /// Whether a partial artifact of this stream can be resumed later.
    /// Decides if cancelled downloads keep their partial file.
    fn supports_resume(&self) -> bool;

    /// Reads up to `max_len` bytes (download direction).
    /// `Ok(None)` signals end of stream.
    async fn read_chunk(&mut self, max_len: usize) -> Result<Option<Bytes>, TransportError>;

    /// Writes one chunk (upload direction).
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), TransportError>;

    /// Finalizes the stream. Upload providers commit the object here.
    async fn close(self: Box<Self>) -> Result<(), TransportError>;
}
