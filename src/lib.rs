//! Megaferry is the transfer orchestration engine for a Telegram/MEGA
//! file ferry bot.
//!
//! This library is the scheduling, state-tracking and failure-handling
//! core that sits between a chat platform and a cloud-storage provider:
//! it accepts transfer requests, admits them under per-user and global
//! resource budgets, streams bytes in bounded chunks through a pluggable
//! transport, persists progress so a crash resumes instead of restarting,
//! and reports one terminal outcome per transfer.
//!
//! Chat-platform and storage-provider specifics stay outside, behind the
//! [`transfer::Transport`] and [`transfer::Notifier`] seams.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging, retry policy
//! - `storage`: the persistent transfer store (SQLite)
//! - `transfer`: governor, dispatch queue, worker pool, orchestrator

pub mod core;
pub mod storage;
pub mod transfer;

// Re-export commonly used types for convenience
pub use crate::core::{EngineError, EngineResult};
pub use crate::storage::{create_pool, get_connection, DbConnection, DbPool};
pub use crate::transfer::{
    Direction, EngineConfig, LogNotifier, NewTransfer, Notifier, Orchestrator, Transfer, TransferState, Transport,
    TransportError, TransportStream,
};
