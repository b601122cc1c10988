use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Which way bytes move through the local disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Storage provider → local disk → chat delivery
    Download,
    /// Chat attachment (staged locally) → storage provider
    Upload,
}

impl Direction {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Download => "download",
            Direction::Upload => "upload",
        }
    }

    /// Parses the store's string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "download" => Some(Direction::Download),
            "upload" => Some(Direction::Upload),
            _ => None,
        }
    }
}

/// Lifecycle state of a transfer.
///
/// Transitions are monotone: `Completed`, `Failed` and `Cancelled` are
/// terminal and have no outgoing edges. The store enforces the same edges
/// in SQL so no race can resurrect a terminal transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    /// Waiting for a worker slot (also the re-entry state after a
    /// recoverable failure or a crash resume)
    Queued,
    /// Exclusively held by one worker, streaming chunks
    Running,
    /// Parked by the governor until disk budget frees up
    Paused,
    /// All bytes moved and confirmed
    Completed,
    /// Non-retryable error, or the attempt ceiling was exhausted
    Failed,
    /// Stopped at the requester's ask
    Cancelled,
}

impl TransferState {
    /// Stable string form used in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferState::Queued => "queued",
            TransferState::Running => "running",
            TransferState::Paused => "paused",
            TransferState::Completed => "completed",
            TransferState::Failed => "failed",
            TransferState::Cancelled => "cancelled",
        }
    }

    /// Parses the store's string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TransferState::Queued),
            "running" => Some(TransferState::Running),
            "paused" => Some(TransferState::Paused),
            "completed" => Some(TransferState::Completed),
            "failed" => Some(TransferState::Failed),
            "cancelled" => Some(TransferState::Cancelled),
            _ => None,
        }
    }

    /// Returns true for states with no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }

    /// Whether the state machine allows `self → next`.
    pub fn can_transition_to(&self, next: TransferState) -> bool {
        use TransferState::*;
        match (self, next) {
            (Queued, Running) | (Queued, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Queued) => true,
            (Running, Cancelled) | (Running, Failed) => true,
            (Paused, Queued) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

/// Snapshot of one transfer as persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Unique transfer identifier (UUID), immutable
    pub id: String,
    /// Direction of the transfer
    pub direction: Direction,
    /// Requesting user/chat id
    pub owner: i64,
    /// Opaque source locator, passed through to the transport untouched
    pub source: String,
    /// Declared or adapter-reported size; None until known
    pub total_bytes: Option<u64>,
    /// Monotone non-decreasing progress counter
    pub bytes_transferred: u64,
    /// Current lifecycle state
    pub state: TransferState,
    /// Count of failed attempts so far (transient failures + crash resumes)
    pub attempt: u32,
    /// Last failure classification and message, cleared on success
    pub last_error: Option<String>,
    /// Upload direction: local path of the staged attachment
    pub staged_file: Option<String>,
    /// Cooperative-cancel flag, persisted so it survives restarts
    pub cancel_requested: bool,
    /// Creation timestamp (RFC 3339)
    pub created_at: String,
    /// Last update timestamp (RFC 3339)
    pub updated_at: String,
}

impl Transfer {
    /// Fraction complete in [0, 1], when the total is known.
    pub fn progress(&self) -> Option<f64> {
        self.total_bytes.filter(|t| *t > 0).map(|t| self.bytes_transferred as f64 / t as f64)
    }
}

/// Parameters for submitting a new transfer.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub direction: Direction,
    pub owner: i64,
    pub source: String,
    /// Declared size if the requester knows it
    pub declared_bytes: Option<u64>,
    /// Upload direction only: local path of the already-fetched attachment
    pub staged_file: Option<String>,
}

impl NewTransfer {
    /// Creates a download request.
    pub fn download(owner: i64, source: impl Into<String>, declared_bytes: Option<u64>) -> Self {
        Self {
            direction: Direction::Download,
            owner,
            source: source.into(),
            declared_bytes,
            staged_file: None,
        }
    }

    /// Creates an upload request for a locally staged file.
    pub fn upload(owner: i64, source: impl Into<String>, staged_file: impl Into<String>, declared_bytes: Option<u64>) -> Self {
        Self {
            direction: Direction::Upload,
            owner,
            source: source.into(),
            declared_bytes,
            staged_file: Some(staged_file.into()),
        }
    }

    /// Fresh UUID for the transfer this request will become.
    pub fn allocate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Current timestamp in the store's format.
    pub fn now() -> String {
        Utc::now().to_rfc3339()
    }
}
