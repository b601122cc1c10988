//! Worker pool: slots that pull admitted transfers and drive them to a
//! terminal state.
//!
//! A dispatcher loop holds a semaphore of `pool_size` permits; a permit is
//! taken *before* an entry leaves the queue, so the number of `running`
//! transfers never exceeds the pool size and queue ordering survives slot
//! waits. Each busy slot exclusively owns one transfer and is the only
//! writer of its progress.
//!
//! The chunk loop is the engine's single suspension pattern: move one
//! chunk, make it durable, persist the offset, then check cancellation and
//! the disk budget. Every interruption (cancel, pause, retry) happens at
//! that boundary, so the store and the partial file can never disagree by
//! more than one unpersisted chunk, and that chunk is truncated away on
//! resume.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::retry::Retryable;
use crate::storage::db::{self, DbPool};
use crate::transfer::governor::{BudgetDecision, Governor};
use crate::transfer::notify::Notifier;
use crate::transfer::queue::{DedupKey, DispatchQueue, QueuedItem};
use crate::transfer::transport::{Transport, TransportError, TransportStream};
use crate::transfer::types::{Direction, Transfer};
use crate::transfer::EngineConfig;

/// Per-transfer cancellation tokens, shared between the orchestrator (who
/// trips them) and the workers (who observe them at chunk boundaries).
#[derive(Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a transfer, created on first use.
    pub async fn token_for(&self, id: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().await;
        tokens.entry(id.to_string()).or_default().clone()
    }

    /// Trips the token for a transfer. Creating-then-cancelling means a
    /// cancel that races the worker's first chunk is still observed.
    pub async fn cancel(&self, id: &str) {
        let mut tokens = self.tokens.lock().await;
        tokens.entry(id.to_string()).or_default().cancel();
    }

    /// Drops the token once the transfer is terminal.
    pub async fn remove(&self, id: &str) {
        let mut tokens = self.tokens.lock().await;
        tokens.remove(id);
    }
}

/// Everything a worker slot needs, cheaply cloneable.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub db: Arc<DbPool>,
    pub queue: Arc<DispatchQueue>,
    pub governor: Arc<Governor>,
    pub transport: Arc<dyn Transport>,
    pub notifier: Arc<dyn Notifier>,
    pub cancellations: Arc<CancellationRegistry>,
    pub config: Arc<EngineConfig>,
}

/// How one run attempt ended.
enum Outcome {
    /// All bytes moved; for downloads, the finalized artifact path
    Completed { artifact: Option<PathBuf> },
    /// Cancellation observed at a chunk boundary
    Cancelled { keep_partial: bool },
    /// Governor parked the transfer; reservation stays
    Paused,
    /// Transport or local I/O failure; classification decides retry
    Failed(TransportError),
}

/// Starts the dispatcher loop. Runs until `shutdown` is cancelled.
pub(crate) fn spawn_dispatcher(ctx: WorkerContext, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(ctx.config.pool_size));
        let mut interval = tokio::time::interval(ctx.config.queue_check_interval);
        log::info!("🚚 Worker pool started ({} slots)", ctx.config.pool_size);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Permit before pop: a transfer only leaves the queue when a
            // slot is actually free.
            let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                continue;
            };
            if let Some(item) = ctx.queue.pop_eligible().await {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    process_transfer(ctx, item).await;
                });
            }
        }

        log::info!("Worker pool stopped");
    })
}

/// Claims one queued transfer and drives it to an outcome.
async fn process_transfer(ctx: WorkerContext, item: QueuedItem) {
    let transfer = {
        let conn = match db::get_connection(&ctx.db) {
            Ok(conn) => conn,
            Err(e) => {
                log::error!("No store connection for transfer {}: {}; re-queueing", item.id, e);
                ctx.queue.push(item.clone()).await;
                return;
            }
        };

        // CAS queued → running; losing means the transfer was cancelled
        // while waiting (or the entry is stale) and there is nothing to do.
        match db::mark_running(&conn, &item.id) {
            Ok(true) => {}
            Ok(false) => {
                log::debug!("Transfer {} no longer claimable, dropping queue entry", item.id);
                return;
            }
            Err(e) => {
                log::error!("Failed to claim transfer {}: {}", item.id, e);
                return;
            }
        }

        match db::get_transfer(&conn, &item.id) {
            Ok(Some(t)) => t,
            Ok(None) => {
                log::error!("Transfer {} vanished after claim", item.id);
                return;
            }
            Err(e) => {
                log::error!("Failed to load transfer {}: {}", item.id, e);
                return;
            }
        }
    };

    log::info!(
        "▶️  Transfer {} running ({:?}, owner {}, attempt {}, offset {})",
        transfer.id,
        transfer.direction,
        transfer.owner,
        transfer.attempt,
        transfer.bytes_transferred
    );

    let token = ctx.cancellations.token_for(&transfer.id).await;
    let outcome = run_transfer(&ctx, &transfer, &token).await;
    settle(&ctx, transfer, outcome).await;
}

/// Applies an outcome: store first, then governor/queue bookkeeping, then
/// exactly one notification. Durability precedes visibility.
async fn settle(ctx: &WorkerContext, transfer: Transfer, outcome: Outcome) {
    let conn = match db::get_connection(&ctx.db) {
        Ok(conn) => conn,
        Err(e) => {
            log::error!("No store connection to settle transfer {}: {}", transfer.id, e);
            return;
        }
    };
    let key = DedupKey::new(transfer.owner, &transfer.source, transfer.direction);

    match outcome {
        Outcome::Completed { artifact } => {
            match db::mark_completed(&conn, &transfer.id) {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("Transfer {} finished but was no longer running", transfer.id);
                    return;
                }
                Err(e) => {
                    log::error!("Failed to mark transfer {} completed: {}", transfer.id, e);
                    return;
                }
            }
            ctx.governor.release(&transfer.id).await;
            ctx.queue.unregister(&key).await;
            ctx.cancellations.remove(&transfer.id).await;

            let snapshot = db::get_transfer(&conn, &transfer.id).ok().flatten().unwrap_or(transfer);
            ctx.notifier.transfer_completed(&snapshot, artifact.as_deref()).await;
            log::info!("✅ Transfer {} completed ({} bytes)", snapshot.id, snapshot.bytes_transferred);

            if !ctx.config.keep_completed_artifacts {
                if let Some(path) = artifact {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        log::warn!("Failed to remove delivered artifact {:?}: {}", path, e);
                    }
                }
            }
        }

        Outcome::Cancelled { keep_partial } => {
            match db::mark_cancelled(&conn, &transfer.id) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    log::error!("Failed to mark transfer {} cancelled: {}", transfer.id, e);
                    return;
                }
            }
            cleanup_artifacts(&ctx.config, &transfer, keep_partial).await;
            ctx.governor.release(&transfer.id).await;
            ctx.queue.unregister(&key).await;
            ctx.cancellations.remove(&transfer.id).await;

            let snapshot = db::get_transfer(&conn, &transfer.id).ok().flatten().unwrap_or(transfer);
            ctx.notifier.transfer_cancelled(&snapshot).await;
            log::info!("🚫 Transfer {} cancelled at chunk boundary", snapshot.id);
        }

        Outcome::Paused => {
            match db::mark_paused(&conn, &transfer.id) {
                Ok(true) => {
                    // Reservation, dedup key and token all stay: the
                    // transfer is still live, just parked.
                    log::warn!(
                        "⏸️  Transfer {} paused at {} bytes: disk budget exhausted",
                        transfer.id,
                        transfer.bytes_transferred
                    );
                }
                Ok(false) => {}
                Err(e) => log::error!("Failed to pause transfer {}: {}", transfer.id, e),
            }
        }

        Outcome::Failed(err) => {
            let message = format!("{}: {}", err.classification(), err);
            if err.is_retryable() {
                let next_attempt = transfer.attempt + 1;
                if next_attempt < ctx.config.retry.max_attempts {
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| ctx.config.retry.delay_for_attempt(transfer.attempt));
                    match db::requeue(&conn, &transfer.id, true, Some(message.as_str())) {
                        Ok(true) => {
                            log::warn!(
                                "🔁 Transfer {} attempt {}/{} failed (retrying in {:?}): {}",
                                transfer.id,
                                next_attempt,
                                ctx.config.retry.max_attempts,
                                delay,
                                message
                            );
                            ctx.queue.push(QueuedItem::delayed(&transfer.id, transfer.owner, delay)).await;
                        }
                        Ok(false) => {}
                        Err(e) => log::error!("Failed to re-queue transfer {}: {}", transfer.id, e),
                    }
                    return;
                }
            }

            let count_attempt = err.is_retryable();
            match db::mark_failed(&conn, &transfer.id, &message, count_attempt) {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    log::error!("Failed to mark transfer {} failed: {}", transfer.id, e);
                    return;
                }
            }
            cleanup_artifacts(&ctx.config, &transfer, false).await;
            ctx.governor.release(&transfer.id).await;
            ctx.queue.unregister(&key).await;
            ctx.cancellations.remove(&transfer.id).await;

            let snapshot = db::get_transfer(&conn, &transfer.id).ok().flatten().unwrap_or(transfer);
            ctx.notifier.transfer_failed(&snapshot, &message).await;
            log::error!("❌ Transfer {} failed terminally: {}", snapshot.id, message);
        }
    }
}

/// Removes local leftovers of a transfer that will not continue.
pub(crate) async fn cleanup_artifacts(config: &EngineConfig, transfer: &Transfer, keep_partial: bool) {
    match transfer.direction {
        Direction::Download => {
            if !keep_partial {
                let part = config.downloads_dir.join(format!("{}.part", transfer.id));
                if let Err(e) = tokio::fs::remove_file(&part).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to remove partial {:?}: {}", part, e);
                    }
                }
            }
        }
        Direction::Upload => {
            if let Some(staged) = &transfer.staged_file {
                if let Err(e) = tokio::fs::remove_file(staged).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        log::warn!("Failed to remove staged file {:?}: {}", staged, e);
                    }
                }
            }
        }
    }
}

async fn run_transfer(ctx: &WorkerContext, transfer: &Transfer, token: &CancellationToken) -> Outcome {
    match transfer.direction {
        Direction::Download => run_download(ctx, transfer, token).await,
        Direction::Upload => run_upload(ctx, transfer, token).await,
    }
}

fn io_transient(context: &str, e: std::io::Error) -> Outcome {
    Outcome::Failed(TransportError::Transient(format!("{}: {}", context, e)))
}

/// Persists a chunk boundary and runs the cancel/budget checks.
///
/// Returns `Some(outcome)` when the transfer must stop at this boundary.
async fn chunk_boundary(
    ctx: &WorkerContext,
    transfer: &Transfer,
    token: &CancellationToken,
    offset: u64,
    total: Option<u64>,
    keep_partial_on_cancel: bool,
) -> Option<Outcome> {
    let conn = match db::get_connection(&ctx.db) {
        Ok(conn) => conn,
        Err(e) => return Some(io_transient("store connection", std::io::Error::other(e))),
    };
    match db::update_progress(&conn, &transfer.id, offset, total) {
        Ok(true) => {}
        // The row left `running` under us; stop without touching it further
        Ok(false) => {
            return Some(Outcome::Cancelled {
                keep_partial: keep_partial_on_cancel,
            })
        }
        Err(e) => return Some(Outcome::Failed(TransportError::Transient(format!("persist offset: {}", e)))),
    }

    if token.is_cancelled() {
        return Some(Outcome::Cancelled {
            keep_partial: keep_partial_on_cancel,
        });
    }

    if ctx.governor.charge(&transfer.id, offset).await == BudgetDecision::Pause {
        return Some(Outcome::Paused);
    }

    None
}

/// Streams storage → local disk.
async fn run_download(ctx: &WorkerContext, transfer: &Transfer, token: &CancellationToken) -> Outcome {
    if let Err(e) = tokio::fs::create_dir_all(&ctx.config.downloads_dir).await {
        return io_transient("create downloads dir", e);
    }
    let part_path = ctx.config.downloads_dir.join(format!("{}.part", transfer.id));
    let mut offset = transfer.bytes_transferred;

    let mut stream: Box<dyn TransportStream> =
        match ctx.transport.open(&transfer.source, Direction::Download, offset).await {
            Ok(stream) => stream,
            Err(e) => return Outcome::Failed(e),
        };

    if stream.resumed_from() != offset {
        // Provider could not resume; restart from its actual offset (zero)
        log::info!(
            "Transfer {}: provider restarted from {} (asked for {})",
            transfer.id,
            stream.resumed_from(),
            offset
        );
        offset = stream.resumed_from();
        match db::get_connection(&ctx.db) {
            Ok(conn) => {
                if let Err(e) = db::reset_progress(&conn, &transfer.id) {
                    return Outcome::Failed(TransportError::Transient(format!("reset progress: {}", e)));
                }
            }
            Err(e) => return io_transient("store connection", std::io::Error::other(e)),
        }
    }

    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&part_path)
        .await
    {
        Ok(file) => file,
        Err(e) => return io_transient("open partial file", e),
    };
    // A crash may have left a chunk past the persisted offset; drop it so
    // disk agrees with the store before any new bytes land.
    if let Err(e) = file.set_len(offset).await {
        return io_transient("truncate partial file", e);
    }
    if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
        return io_transient("seek partial file", e);
    }

    let total = transfer.total_bytes.or(stream.total_bytes());
    let supports_resume = stream.supports_resume();

    loop {
        let chunk = match stream.read_chunk(ctx.config.chunk_size).await {
            Ok(chunk) => chunk,
            Err(e) => return Outcome::Failed(e),
        };

        match chunk {
            Some(bytes) => {
                if let Err(e) = file.write_all(&bytes).await {
                    return io_transient("write chunk", e);
                }
                // Durable before the offset is persisted (write-ahead)
                if let Err(e) = file.sync_data().await {
                    return io_transient("sync chunk", e);
                }
                offset += bytes.len() as u64;

                if let Some(t) = total {
                    if offset > t {
                        return Outcome::Failed(TransportError::Transient(format!(
                            "stream exceeded expected size ({} > {})",
                            offset, t
                        )));
                    }
                }

                if let Some(outcome) = chunk_boundary(ctx, transfer, token, offset, total, supports_resume).await {
                    return outcome;
                }
            }
            None => {
                if let Some(t) = total {
                    if offset != t {
                        return Outcome::Failed(TransportError::Transient(format!(
                            "stream ended early ({} of {} bytes)",
                            offset, t
                        )));
                    }
                }
                if let Err(e) = file.sync_all().await {
                    return io_transient("sync artifact", e);
                }
                if let Err(e) = stream.close().await {
                    return Outcome::Failed(e);
                }

                // Size was unknown: the stream's end defines the total
                if total.is_none() {
                    let conn = match db::get_connection(&ctx.db) {
                        Ok(conn) => conn,
                        Err(e) => return io_transient("store connection", std::io::Error::other(e)),
                    };
                    if let Err(e) = db::update_progress(&conn, &transfer.id, offset, Some(offset)) {
                        return Outcome::Failed(TransportError::Transient(format!("persist total: {}", e)));
                    }
                }

                let final_path = ctx.config.downloads_dir.join(&transfer.id);
                if let Err(e) = tokio::fs::rename(&part_path, &final_path).await {
                    return io_transient("finalize artifact", e);
                }
                return Outcome::Completed {
                    artifact: Some(final_path),
                };
            }
        }
    }
}

/// Streams a locally staged file → storage.
async fn run_upload(ctx: &WorkerContext, transfer: &Transfer, token: &CancellationToken) -> Outcome {
    let Some(staged) = transfer.staged_file.as_deref() else {
        return Outcome::Failed(TransportError::NotFound("upload has no staged file".to_string()));
    };

    let file_len = match tokio::fs::metadata(staged).await {
        Ok(meta) => meta.len(),
        // The staged source is gone; retrying cannot bring it back
        Err(e) => return Outcome::Failed(TransportError::NotFound(format!("staged file {}: {}", staged, e))),
    };

    let mut offset = transfer.bytes_transferred;
    let mut stream: Box<dyn TransportStream> =
        match ctx.transport.open(&transfer.source, Direction::Upload, offset).await {
            Ok(stream) => stream,
            Err(e) => return Outcome::Failed(e),
        };

    if stream.resumed_from() != offset {
        log::info!(
            "Transfer {}: provider restarted upload from {} (asked for {})",
            transfer.id,
            stream.resumed_from(),
            offset
        );
        offset = stream.resumed_from();
        match db::get_connection(&ctx.db) {
            Ok(conn) => {
                if let Err(e) = db::reset_progress(&conn, &transfer.id) {
                    return Outcome::Failed(TransportError::Transient(format!("reset progress: {}", e)));
                }
            }
            Err(e) => return io_transient("store connection", std::io::Error::other(e)),
        }
    }

    let mut file = match tokio::fs::File::open(staged).await {
        Ok(file) => file,
        Err(e) => return io_transient("open staged file", e),
    };
    if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
        return io_transient("seek staged file", e);
    }

    // The staged file on disk is authoritative over any declared size
    let total = Some(file_len);
    let mut buf = vec![0u8; ctx.config.chunk_size];

    loop {
        let read = match file.read(&mut buf).await {
            Ok(read) => read,
            Err(e) => return io_transient("read staged file", e),
        };

        if read == 0 {
            if offset != file_len {
                return Outcome::Failed(TransportError::Transient(format!(
                    "staged file ended early ({} of {} bytes)",
                    offset, file_len
                )));
            }
            // Commit on the provider side before reporting completion
            if let Err(e) = stream.close().await {
                return Outcome::Failed(e);
            }
            let conn = match db::get_connection(&ctx.db) {
                Ok(conn) => conn,
                Err(e) => return io_transient("store connection", std::io::Error::other(e)),
            };
            if let Err(e) = db::update_progress(&conn, &transfer.id, offset, total) {
                return Outcome::Failed(TransportError::Transient(format!("persist total: {}", e)));
            }
            // The bytes live in storage now; the staged copy has no further use
            if let Err(e) = tokio::fs::remove_file(staged).await {
                log::warn!("Failed to remove staged file {}: {}", staged, e);
            }
            return Outcome::Completed { artifact: None };
        }

        if let Err(e) = stream.write_chunk(&buf[..read]).await {
            return Outcome::Failed(e);
        }
        offset += read as u64;

        if let Some(outcome) = chunk_boundary(ctx, transfer, token, offset, total, false).await {
            return outcome;
        }
    }
}
