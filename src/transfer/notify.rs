//! Terminal-notification seam.
//!
//! The engine reports exactly one terminal outcome per transfer to the
//! embedding chat adapter, after the outcome is persisted. Progress is not
//! pushed; pollers use `Orchestrator::status`.

use async_trait::async_trait;
use std::path::Path;

use crate::transfer::types::Transfer;

/// Receives terminal-state notifications for delivery to the requester.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// The transfer finished; for downloads `artifact` is the completed
    /// local file to deliver.
    async fn transfer_completed(&self, transfer: &Transfer, artifact: Option<&Path>);

    /// The transfer failed terminally; `reason` is the human-readable
    /// classification.
    async fn transfer_failed(&self, transfer: &Transfer, reason: &str);

    /// The transfer was cancelled at the requester's ask.
    async fn transfer_cancelled(&self, transfer: &Transfer);
}

/// Notifier that only logs. Useful for tests and headless runs.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn transfer_completed(&self, transfer: &Transfer, artifact: Option<&Path>) {
        log::info!(
            "✅ Transfer {} completed ({} bytes){}",
            transfer.id,
            transfer.bytes_transferred,
            artifact.map(|p| format!(", artifact: {}", p.display())).unwrap_or_default()
        );
    }

    async fn transfer_failed(&self, transfer: &Transfer, reason: &str) {
        log::error!("❌ Transfer {} failed: {}", transfer.id, reason);
    }

    async fn transfer_cancelled(&self, transfer: &Transfer) {
        log::info!("🚫 Transfer {} cancelled", transfer.id);
    }
}
