use std::collections::{HashSet, VecDeque};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::transfer::types::Direction;

/// Maximum number of entries allowed in the queue to prevent unbounded
/// memory growth.
const MAX_QUEUE_SIZE: usize = 1000;

/// Identity of a live request, used to suppress duplicate submissions
/// while an equivalent transfer is still non-terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub owner: i64,
    pub source: String,
    pub direction: Direction,
}

impl DedupKey {
    pub fn new(owner: i64, source: &str, direction: Direction) -> Self {
        Self {
            owner,
            source: source.to_string(),
            direction,
        }
    }
}

/// One dispatchable entry. The full transfer record lives in the store;
/// the queue only carries what scheduling needs.
#[derive(Debug, Clone)]
pub struct QueuedItem {
    /// Transfer id
    pub id: String,
    /// Owner, for round-robin fairness
    pub owner: i64,
    /// Earliest instant this entry may be dispatched (backoff gating);
    /// None = immediately eligible
    pub not_before: Option<Instant>,
}

impl QueuedItem {
    /// An immediately eligible entry.
    pub fn ready(id: impl Into<String>, owner: i64) -> Self {
        Self {
            id: id.into(),
            owner,
            not_before: None,
        }
    }

    /// An entry gated behind a backoff delay.
    pub fn delayed(id: impl Into<String>, owner: i64, delay: std::time::Duration) -> Self {
        Self {
            id: id.into(),
            owner,
            not_before: Some(Instant::now() + delay),
        }
    }

    fn is_eligible(&self, now: Instant) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

/// Thread-safe dispatch queue for transfers.
///
/// FIFO within one owner; across owners, dispatch round-robins so a busy
/// owner cannot starve the others. Entries carry an optional eligibility
/// instant so retried transfers wait out their backoff without blocking
/// the queue.
pub struct DispatchQueue {
    /// Internal entry queue protected by a mutex
    queue: Mutex<VecDeque<QueuedItem>>,
    /// Live request identities (queued + running + paused), for duplicate
    /// suppression. Cleared when the transfer reaches a terminal state.
    active_keys: Mutex<HashSet<DedupKey>>,
    /// Owner served by the most recent dispatch, for round-robin
    last_owner: Mutex<Option<i64>>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            active_keys: Mutex::new(HashSet::new()),
            last_owner: Mutex::new(None),
        }
    }

    /// Registers a request identity, refusing duplicates.
    ///
    /// Returns false when an equivalent request is still live. Called by
    /// the orchestrator before the store insert, so a duplicate never gets
    /// a record.
    pub async fn register(&self, key: DedupKey) -> bool {
        let mut active = self.active_keys.lock().await;
        if active.contains(&key) {
            log::warn!(
                "Duplicate submission for owner {} ({:?} {}), skipping",
                key.owner,
                key.direction,
                key.source
            );
            return false;
        }
        active.insert(key);
        true
    }

    /// Drops a request identity once its transfer is terminal, freeing the
    /// slot for resubmission.
    pub async fn unregister(&self, key: &DedupKey) {
        let mut active = self.active_keys.lock().await;
        active.remove(key);
    }

    /// Adds an entry to the queue.
    ///
    /// Returns false when the queue is at capacity.
    pub async fn push(&self, item: QueuedItem) -> bool {
        let mut queue = self.queue.lock().await;
        if queue.len() >= MAX_QUEUE_SIZE {
            log::warn!("Queue is full ({} entries), rejecting transfer {}", queue.len(), item.id);
            return false;
        }
        queue.push_back(item);
        true
    }

    /// Pops the next dispatchable entry.
    ///
    /// Scans in FIFO order for entries whose backoff has elapsed; when
    /// several owners have eligible work, an owner different from the one
    /// served last is preferred, which round-robins dispatch under
    /// contention.
    pub async fn pop_eligible(&self) -> Option<QueuedItem> {
        let now = Instant::now();
        let mut queue = self.queue.lock().await;
        let mut last_owner = self.last_owner.lock().await;

        let first_eligible = queue.iter().position(|item| item.is_eligible(now))?;

        let chosen = match *last_owner {
            Some(last) => queue
                .iter()
                .enumerate()
                .skip(first_eligible)
                .find(|(_, item)| item.is_eligible(now) && item.owner != last)
                .map(|(idx, _)| idx)
                .unwrap_or(first_eligible),
            None => first_eligible,
        };

        let item = queue.remove(chosen)?;
        *last_owner = Some(item.owner);
        Some(item)
    }

    /// Removes a queued entry by transfer id (cancellation of a waiting
    /// transfer). Returns true if an entry was removed.
    pub async fn remove(&self, id: &str) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|item| item.id != id);
        before != queue.len()
    }

    /// Current number of waiting entries.
    pub async fn size(&self) -> usize {
        let queue = self.queue.lock().await;
        queue.len()
    }

    /// 1-based position of a transfer in the queue, or None.
    pub async fn position(&self, id: &str) -> Option<usize> {
        let queue = self.queue.lock().await;
        queue.iter().position(|item| item.id == id).map(|pos| pos + 1)
    }
}
