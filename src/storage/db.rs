use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Result;

use crate::transfer::types::{Direction, NewTransfer, Transfer, TransferState};

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Create a new database connection pool
///
/// Initializes a connection pool with up to 10 connections and ensures the
/// transfer schema exists. The parent directory of the database file is
/// created if missing.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
///
/// # Returns
///
/// Returns a `DbPool` on success or an `r2d2::Error` if pool creation fails.
///
/// # Example
///
/// ```no_run
/// use megaferry::storage::db;
///
/// let pool = db::create_pool("data/megaferry.sqlite")?;
/// # Ok::<(), r2d2::Error>(())
/// ```
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    if let Some(parent) = std::path::Path::new(database_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Failed to create database directory {:?}: {}", parent, e);
            }
        }
    }

    let manager = SqliteConnectionManager::file(database_path).with_init(|conn| {
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        Ok(())
    });
    let pool = Pool::builder()
        .max_size(10) // Maximum 10 connections in the pool
        .build(manager)?;

    // Ensure schema is up to date on first connection
    let conn = pool.get()?;
    if let Err(e) = migrate_schema(&conn) {
        log::warn!("Failed to migrate schema: {}", e);
        // Don't fail on migration errors, as they might be expected
    }

    Ok(pool)
}

/// Get a connection from the pool
///
/// The connection is automatically returned to the pool when dropped.
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

/// Cheap readiness probe: the store answers a trivial query.
pub fn health_check(pool: &DbPool) -> bool {
    match pool.get() {
        Ok(conn) => conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0)).is_ok(),
        Err(_) => false,
    }
}

/// Migrate database schema to ensure all required tables exist
fn migrate_schema(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transfers (
            id TEXT PRIMARY KEY,
            direction TEXT NOT NULL,
            owner INTEGER NOT NULL,
            source TEXT NOT NULL,
            total_bytes INTEGER,
            bytes_transferred INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL DEFAULT 'queued',
            attempt INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            staged_file TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // Indexes backing the startup resume-scan and per-owner quota counting
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transfers_owner ON transfers(owner)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transfers_state ON transfers(state)",
        [],
    )?;

    Ok(())
}

const TRANSFER_COLUMNS: &str = "id, direction, owner, source, total_bytes, bytes_transferred, state, attempt, last_error, staged_file, cancel_requested, created_at, updated_at";

fn row_to_transfer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transfer> {
    let direction: String = row.get(1)?;
    let state: String = row.get(6)?;
    Ok(Transfer {
        id: row.get(0)?,
        direction: Direction::parse(&direction).unwrap_or(Direction::Download),
        owner: row.get(2)?,
        source: row.get(3)?,
        total_bytes: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        bytes_transferred: row.get::<_, i64>(5)? as u64,
        // A state string this build doesn't know is treated as failed
        // rather than resurrected into the scheduler.
        state: TransferState::parse(&state).unwrap_or(TransferState::Failed),
        attempt: row.get::<_, i64>(7)? as u32,
        last_error: row.get(8)?,
        staged_file: row.get(9)?,
        cancel_requested: row.get::<_, i32>(10)? == 1,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

/// Persists a freshly admitted transfer as `queued`.
///
/// # Arguments
///
/// * `conn` - Database connection
/// * `id` - Pre-allocated transfer id
/// * `request` - Submit parameters
pub fn insert_transfer(conn: &DbConnection, id: &str, request: &NewTransfer) -> Result<()> {
    conn.execute(
        "INSERT INTO transfers (id, direction, owner, source, total_bytes, staged_file, state)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued')",
        rusqlite::params![
            id,
            request.direction.as_str(),
            request.owner,
            request.source,
            request.declared_bytes.map(|v| v as i64),
            request.staged_file,
        ],
    )?;
    Ok(())
}

/// Gets a transfer snapshot by id.
pub fn get_transfer(conn: &DbConnection, id: &str) -> Result<Option<Transfer>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM transfers WHERE id = ?1", TRANSFER_COLUMNS))?;
    let mut rows = stmt.query_map(rusqlite::params![id], row_to_transfer)?;

    if let Some(row) = rows.next() {
        Ok(Some(row?))
    } else {
        Ok(None)
    }
}

/// Lists all transfers belonging to an owner, newest first.
pub fn list_by_owner(conn: &DbConnection, owner: i64) -> Result<Vec<Transfer>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transfers WHERE owner = ?1 ORDER BY created_at DESC",
        TRANSFER_COLUMNS
    ))?;
    let rows = stmt.query_map(rusqlite::params![owner], row_to_transfer)?;

    let mut transfers = Vec::new();
    for row in rows {
        transfers.push(row?);
    }
    Ok(transfers)
}

/// Lists all transfers in a given state, oldest first (submission order).
pub fn list_by_state(conn: &DbConnection, state: TransferState) -> Result<Vec<Transfer>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transfers WHERE state = ?1 ORDER BY created_at ASC",
        TRANSFER_COLUMNS
    ))?;
    let rows = stmt.query_map(rusqlite::params![state.as_str()], row_to_transfer)?;

    let mut transfers = Vec::new();
    for row in rows {
        transfers.push(row?);
    }
    Ok(transfers)
}

/// Lists all non-terminal transfers, oldest first.
///
/// Feeds the startup resume-scan and the governor's reservation rebuild.
pub fn list_active(conn: &DbConnection) -> Result<Vec<Transfer>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM transfers WHERE state IN ('queued', 'running', 'paused') ORDER BY created_at ASC",
        TRANSFER_COLUMNS
    ))?;
    let rows = stmt.query_map([], row_to_transfer)?;

    let mut transfers = Vec::new();
    for row in rows {
        transfers.push(row?);
    }
    Ok(transfers)
}

/// Claims a queued transfer for a worker: `queued → running`.
///
/// The `WHERE` guard is the exclusivity mechanism: at most one caller sees
/// `true`, and a transfer cancelled while waiting is never claimed.
pub fn mark_running(conn: &DbConnection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers SET state = 'running', updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state = 'queued' AND cancel_requested = 0",
        rusqlite::params![id],
    )?;
    Ok(rows > 0)
}

/// Persists the offset after a durably written chunk, optionally recording
/// the adapter-reported total size.
///
/// The monotonic guard refuses to move the counter backwards; the state
/// guard stops a stale worker from writing after a cancellation landed.
pub fn update_progress(conn: &DbConnection, id: &str, bytes_transferred: u64, total_bytes: Option<u64>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers
         SET bytes_transferred = ?2,
             total_bytes = COALESCE(?3, total_bytes),
             updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state = 'running' AND bytes_transferred <= ?2",
        rusqlite::params![id, bytes_transferred as i64, total_bytes.map(|v| v as i64)],
    )?;
    Ok(rows > 0)
}

/// Resets progress to zero for an adapter that could not resume.
pub fn reset_progress(conn: &DbConnection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE transfers SET bytes_transferred = 0, updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state = 'running'",
        rusqlite::params![id],
    )?;
    Ok(())
}

/// Marks a running transfer completed and clears its last error.
pub fn mark_completed(conn: &DbConnection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers SET state = 'completed', last_error = NULL, updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state = 'running'",
        rusqlite::params![id],
    )?;
    Ok(rows > 0)
}

/// Marks a transfer failed with its terminal error classification.
///
/// `count_attempt` is true when the failure was retryable but the ceiling
/// is exhausted (the final failed attempt still counts); non-retryable
/// failures leave the counter untouched.
pub fn mark_failed(conn: &DbConnection, id: &str, error_message: &str, count_attempt: bool) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers
         SET state = 'failed',
             last_error = ?2,
             attempt = attempt + ?3,
             updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state = 'running'",
        rusqlite::params![id, error_message, if count_attempt { 1 } else { 0 }],
    )?;
    Ok(rows > 0)
}

/// Parks a running transfer until disk budget frees up.
pub fn mark_paused(conn: &DbConnection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers SET state = 'paused', updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state = 'running'",
        rusqlite::params![id],
    )?;
    Ok(rows > 0)
}

/// Sends a transfer back to `queued` after a recoverable failure, a crash
/// resume, or a budget un-pause.
///
/// # Arguments
///
/// * `conn` - Database connection
/// * `id` - Transfer id
/// * `count_attempt` - Whether this re-queue counts against the attempt
///   ceiling (failures and crash resumes do; un-pausing does not)
/// * `error_message` - Failure that caused the re-queue, if any
pub fn requeue(conn: &DbConnection, id: &str, count_attempt: bool, error_message: Option<&str>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers
         SET state = 'queued',
             attempt = attempt + ?2,
             last_error = COALESCE(?3, last_error),
             updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state IN ('running', 'paused')",
        rusqlite::params![id, if count_attempt { 1 } else { 0 }, error_message],
    )?;
    Ok(rows > 0)
}

/// Marks a non-terminal transfer cancelled.
pub fn mark_cancelled(conn: &DbConnection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers SET state = 'cancelled', updated_at = CURRENT_TIMESTAMP
         WHERE id = ?1 AND state IN ('queued', 'running', 'paused')",
        rusqlite::params![id],
    )?;
    Ok(rows > 0)
}

/// Raises the persistent cancel flag. Returns false for unknown ids.
///
/// The flag survives restarts, so a cancel against a queued transfer still
/// holds after a crash; workers additionally observe the in-memory token.
pub fn set_cancel_requested(conn: &DbConnection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE transfers SET cancel_requested = 1, updated_at = CURRENT_TIMESTAMP WHERE id = ?1",
        rusqlite::params![id],
    )?;
    Ok(rows > 0)
}

/// Removes a record that never got dispatched (submit rollback).
pub fn delete_transfer(conn: &DbConnection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM transfers WHERE id = ?1 AND state = 'queued'",
        rusqlite::params![id],
    )?;
    Ok(rows > 0)
}

/// Deletes terminal transfer records older than the purge window.
///
/// Returns the number of rows removed.
pub fn purge_terminal_older_than(conn: &DbConnection, days: u32) -> Result<usize> {
    let rows = conn.execute(
        "DELETE FROM transfers
         WHERE state IN ('completed', 'failed', 'cancelled')
           AND updated_at < datetime('now', '-' || ?1 || ' days')",
        rusqlite::params![days],
    )?;
    Ok(rows)
}
