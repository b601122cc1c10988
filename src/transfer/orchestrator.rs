//! Orchestrator: the engine's façade.
//!
//! Accepts transfer requests, consults the governor, persists state,
//! dispatches to the worker pool, and exposes status/cancel. Every state
//! change is persisted before any caller or notifier observes it. The
//! orchestrator itself performs no network or chunk I/O; only the
//! workers do.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::error::{EngineError, EngineResult};
use crate::storage::db::{self, DbPool};
use crate::transfer::governor::Governor;
use crate::transfer::notify::Notifier;
use crate::transfer::queue::{DedupKey, DispatchQueue, QueuedItem};
use crate::transfer::transport::Transport;
use crate::transfer::types::{Direction, NewTransfer, Transfer, TransferState};
use crate::transfer::worker::{self, CancellationRegistry, WorkerContext};
use crate::transfer::EngineConfig;

/// The transfer engine façade.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use megaferry::storage::db;
/// use megaferry::transfer::{EngineConfig, LogNotifier, NewTransfer, Orchestrator};
/// # use megaferry::transfer::Transport;
///
/// # async fn example(transport: Arc<dyn Transport>) -> megaferry::core::EngineResult<()> {
/// let pool = db::create_pool("data/megaferry.sqlite")?;
/// let engine = Orchestrator::new(pool, transport, Arc::new(LogNotifier), EngineConfig::default());
/// engine.start().await?;
///
/// let id = engine.submit(NewTransfer::download(123, "mega://folder/abc#key", None)).await?;
/// let snapshot = engine.status(&id).await?;
/// println!("state: {:?}", snapshot.state);
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    db: Arc<DbPool>,
    queue: Arc<DispatchQueue>,
    governor: Arc<Governor>,
    cancellations: Arc<CancellationRegistry>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    config: Arc<EngineConfig>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Creates an engine over an existing store pool and the two adapter
    /// seams. Call [`start`](Self::start) to recover interrupted transfers
    /// and begin dispatching.
    pub fn new(
        db: DbPool,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        let governor = Arc::new(Governor::new(config.limits.clone()));
        Self {
            db: Arc::new(db),
            queue: Arc::new(DispatchQueue::new()),
            governor,
            cancellations: Arc::new(CancellationRegistry::new()),
            transport,
            notifier,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }

    /// Recovers interrupted transfers from the store, then starts the
    /// dispatcher and the paused-budget re-check task.
    pub async fn start(&self) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.config.downloads_dir).await?;
        self.resume_interrupted().await?;
        let _dispatcher = worker::spawn_dispatcher(self.worker_context(), self.shutdown.clone());
        let _recheck = self.spawn_budget_recheck();
        Ok(())
    }

    /// Stops the dispatcher and background tasks. In-flight chunk writes
    /// finish; nothing new is claimed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accepts a new transfer request.
    ///
    /// Admission, duplicate suppression and the store insert happen here;
    /// the call never performs network I/O and returns as soon as the
    /// `queued` record is durable.
    ///
    /// # Errors
    ///
    /// * [`EngineError::QuotaExceeded`] - governor refused admission
    /// * [`EngineError::Validation`] - malformed request or live duplicate
    pub async fn submit(&self, request: NewTransfer) -> EngineResult<String> {
        if request.source.trim().is_empty() {
            return Err(EngineError::Validation("empty source locator".to_string()));
        }
        if request.direction == Direction::Upload && request.staged_file.is_none() {
            return Err(EngineError::Validation("upload requires a staged file".to_string()));
        }

        let id = NewTransfer::allocate_id();
        self.governor
            .try_admit(request.owner, &id, request.declared_bytes)
            .await
            .map_err(EngineError::QuotaExceeded)?;

        let key = DedupKey::new(request.owner, &request.source, request.direction);
        if !self.queue.register(key.clone()).await {
            self.governor.release(&id).await;
            return Err(EngineError::Validation(
                "an equivalent transfer is already in flight".to_string(),
            ));
        }

        let insert = db::get_connection(&self.db)
            .map_err(EngineError::from)
            .and_then(|conn| db::insert_transfer(&conn, &id, &request).map_err(EngineError::from));
        if let Err(e) = insert {
            self.governor.release(&id).await;
            self.queue.unregister(&key).await;
            return Err(e);
        }

        if !self.queue.push(QueuedItem::ready(&id, request.owner)).await {
            // Queue at capacity: roll the submission back entirely
            if let Ok(conn) = db::get_connection(&self.db) {
                let _ = db::delete_transfer(&conn, &id);
            }
            self.governor.release(&id).await;
            self.queue.unregister(&key).await;
            return Err(EngineError::Validation("transfer queue is full".to_string()));
        }

        log::info!(
            "📥 Transfer {} queued ({:?}, owner {}, {} bytes declared)",
            id,
            request.direction,
            request.owner,
            request.declared_bytes.map(|b| b.to_string()).unwrap_or_else(|| "?".to_string())
        );
        Ok(id)
    }

    /// Cancels a transfer.
    ///
    /// Waiting and parked transfers are cancelled on the spot; a running
    /// one is signalled and stops at its next chunk boundary. Idempotent:
    /// already-terminal transfers are a no-op.
    ///
    /// # Errors
    ///
    /// * [`EngineError::NotFound`] - unknown transfer id
    pub async fn cancel(&self, id: &str) -> EngineResult<()> {
        let conn = db::get_connection(&self.db)?;
        let Some(transfer) = db::get_transfer(&conn, id)? else {
            return Err(EngineError::NotFound(id.to_string()));
        };
        if transfer.state.is_terminal() {
            return Ok(());
        }

        // Persisted first so the intent survives a restart
        db::set_cancel_requested(&conn, id)?;

        match transfer.state {
            TransferState::Queued | TransferState::Paused => {
                if db::mark_cancelled(&conn, id)? {
                    self.queue.remove(id).await;
                    self.queue
                        .unregister(&DedupKey::new(transfer.owner, &transfer.source, transfer.direction))
                        .await;
                    self.governor.release(id).await;
                    self.cancellations.remove(id).await;
                    worker::cleanup_artifacts(&self.config, &transfer, false).await;

                    let snapshot = db::get_transfer(&conn, id)?.unwrap_or(transfer);
                    self.notifier.transfer_cancelled(&snapshot).await;
                    log::info!("🚫 Transfer {} cancelled while waiting", id);
                } else {
                    // A worker claimed it in the meantime; the token path
                    // catches it at the next chunk boundary
                    self.cancellations.cancel(id).await;
                }
            }
            TransferState::Running => {
                self.cancellations.cancel(id).await;
                log::info!("🚫 Cancellation signalled for running transfer {}", id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Snapshot of one transfer.
    ///
    /// # Errors
    ///
    /// * [`EngineError::NotFound`] - unknown transfer id
    pub async fn status(&self, id: &str) -> EngineResult<Transfer> {
        let conn = db::get_connection(&self.db)?;
        db::get_transfer(&conn, id)?.ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// All transfers of one owner, newest first.
    pub async fn list_by_owner(&self, owner: i64) -> EngineResult<Vec<Transfer>> {
        let conn = db::get_connection(&self.db)?;
        Ok(db::list_by_owner(&conn, owner)?)
    }

    /// Liveness signal: ready to accept submits and the store answers.
    pub fn health(&self) -> bool {
        !self.shutdown.is_cancelled() && db::health_check(&self.db)
    }

    /// Deletes terminal records older than `days` (housekeeping hook for
    /// the embedding binary).
    pub async fn purge_terminal_older_than(&self, days: u32) -> EngineResult<usize> {
        let conn = db::get_connection(&self.db)?;
        Ok(db::purge_terminal_older_than(&conn, days)?)
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            db: Arc::clone(&self.db),
            queue: Arc::clone(&self.queue),
            governor: Arc::clone(&self.governor),
            transport: Arc::clone(&self.transport),
            notifier: Arc::clone(&self.notifier),
            cancellations: Arc::clone(&self.cancellations),
            config: Arc::clone(&self.config),
        }
    }

    /// Startup scan: rows left `running` imply a prior crash and re-enter
    /// the retry state machine; `paused` and `queued` rows are re-seeded.
    async fn resume_interrupted(&self) -> EngineResult<()> {
        let conn = db::get_connection(&self.db)?;
        let active = db::list_active(&conn)?;
        self.governor.rebuild(&active).await;

        if active.is_empty() {
            log::info!("✅ No interrupted transfers to recover");
            return Ok(());
        }

        log::info!("═══════════════════════════════════════════════════════════");
        log::info!("🔄 Found {} interrupted transfer(s) in the store", active.len());
        log::info!("═══════════════════════════════════════════════════════════");

        let mut recovered = 0usize;
        for transfer in active {
            // Re-seed duplicate suppression for everything still live
            self.queue
                .register(DedupKey::new(transfer.owner, &transfer.source, transfer.direction))
                .await;

            log::info!(
                "  Transfer {} ({:?}, owner {}, state {:?}, attempt {}, {} bytes done)",
                transfer.id,
                transfer.direction,
                transfer.owner,
                transfer.state,
                transfer.attempt,
                transfer.bytes_transferred
            );

            if transfer.cancel_requested {
                self.settle_recovered_cancel(&conn, transfer).await?;
                continue;
            }

            match transfer.state {
                TransferState::Running => {
                    // Crash-resume is a transient failure: same counter,
                    // same ceiling, so a crash-looping transfer terminates
                    let next_attempt = transfer.attempt + 1;
                    if next_attempt >= self.config.retry.max_attempts {
                        let message = "transient: interrupted by restart, attempts exhausted";
                        if db::mark_failed(&conn, &transfer.id, message, true)? {
                            worker::cleanup_artifacts(&self.config, &transfer, false).await;
                            self.governor.release(&transfer.id).await;
                            self.queue
                                .unregister(&DedupKey::new(transfer.owner, &transfer.source, transfer.direction))
                                .await;
                            let snapshot = db::get_transfer(&conn, &transfer.id)?.unwrap_or(transfer);
                            self.notifier.transfer_failed(&snapshot, message).await;
                        }
                    } else if db::requeue(&conn, &transfer.id, true, Some("transient: interrupted by restart"))? {
                        self.queue.push(QueuedItem::ready(&transfer.id, transfer.owner)).await;
                        recovered += 1;
                    }
                }
                TransferState::Paused => {
                    // Budget state did not survive the restart; let the
                    // governor re-decide. Not a failure, no attempt counted.
                    if db::requeue(&conn, &transfer.id, false, None)? {
                        self.queue.push(QueuedItem::ready(&transfer.id, transfer.owner)).await;
                        recovered += 1;
                    }
                }
                TransferState::Queued => {
                    self.queue.push(QueuedItem::ready(&transfer.id, transfer.owner)).await;
                    recovered += 1;
                }
                _ => {}
            }
        }

        log::info!("═══════════════════════════════════════════════════════════");
        log::info!("✅ Recovery completed: {} transfer(s) re-queued", recovered);
        log::info!("═══════════════════════════════════════════════════════════");
        Ok(())
    }

    /// Terminal path for a recovered row whose cancel flag was raised just
    /// before the crash.
    async fn settle_recovered_cancel(&self, conn: &db::DbConnection, transfer: Transfer) -> EngineResult<()> {
        if db::mark_cancelled(conn, &transfer.id)? {
            worker::cleanup_artifacts(&self.config, &transfer, false).await;
            self.governor.release(&transfer.id).await;
            self.queue
                .unregister(&DedupKey::new(transfer.owner, &transfer.source, transfer.direction))
                .await;
            let snapshot = db::get_transfer(conn, &transfer.id)?.unwrap_or(transfer);
            self.notifier.transfer_cancelled(&snapshot).await;
        }
        Ok(())
    }

    /// Periodic re-check that un-parks paused transfers once budget frees
    /// up. Interval-gated, never faster than the configured cadence.
    fn spawn_budget_recheck(&self) -> JoinHandle<()> {
        let db = Arc::clone(&self.db);
        let queue = Arc::clone(&self.queue);
        let governor = Arc::clone(&self.governor);
        let shutdown = self.shutdown.clone();
        let interval = self.config.budget_recheck_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if !governor.has_free_budget().await {
                    continue;
                }
                let Ok(conn) = db::get_connection(&db) else { continue };
                let Ok(paused) = db::list_by_state(&conn, TransferState::Paused) else {
                    continue;
                };

                for transfer in paused {
                    if transfer.cancel_requested {
                        continue;
                    }
                    match db::requeue(&conn, &transfer.id, false, None) {
                        Ok(true) => {
                            log::info!("▶️  Transfer {} un-paused, budget available again", transfer.id);
                            queue.push(QueuedItem::ready(&transfer.id, transfer.owner)).await;
                        }
                        Ok(false) => {}
                        Err(e) => log::warn!("Failed to un-pause transfer {}: {}", transfer.id, e),
                    }
                }
            }
        })
    }
}
