//! Quota and rate governor.
//!
//! Admission control for new transfers and disk-budget tracking for
//! transfers in flight. All counters live behind one mutex and are only
//! reachable through the explicit admit / charge / release protocol, so an
//! admit and its matching release always net to zero even under concurrent
//! completions.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::core::config;
use crate::transfer::types::Transfer;

/// Why admission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deny {
    /// Owner already holds the maximum number of non-terminal transfers
    PerUserLimit,
    /// The downloads area has no room for the declared size
    GlobalDiskBudget,
    /// Owner submitted too often inside the sliding window
    RateLimited,
}

impl std::fmt::Display for Deny {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Deny::PerUserLimit => write!(f, "per-user transfer limit reached"),
            Deny::GlobalDiskBudget => write!(f, "global disk budget exhausted"),
            Deny::RateLimited => write!(f, "submission rate limit reached"),
        }
    }
}

/// Verdict for an in-flight budget check at a chunk boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    /// Keep streaming
    Within,
    /// Actual usage would overrun the global budget; park the transfer
    Pause,
}

/// Admission limits enforced by the governor.
#[derive(Debug, Clone)]
pub struct GovernorLimits {
    /// Maximum non-terminal transfers per owner
    pub per_owner_max_active: usize,
    /// Sliding window for submission rate limiting
    pub rate_window: Duration,
    /// Maximum submissions per owner inside the window
    pub rate_max_submits: usize,
    /// Global byte budget for the downloads area
    pub disk_budget_bytes: u64,
    /// Reservation used when the declared size is unknown
    pub default_reservation_bytes: u64,
}

impl Default for GovernorLimits {
    fn default() -> Self {
        Self {
            per_owner_max_active: config::limits::PER_OWNER_MAX_ACTIVE,
            rate_window: config::limits::rate_window(),
            rate_max_submits: config::limits::RATE_MAX_SUBMITS,
            disk_budget_bytes: config::limits::DISK_BUDGET_BYTES,
            default_reservation_bytes: config::limits::DEFAULT_RESERVATION_BYTES,
        }
    }
}

impl GovernorLimits {
    /// Sets the per-owner active transfer limit.
    #[must_use]
    pub fn per_owner_max_active(mut self, max: usize) -> Self {
        self.per_owner_max_active = max;
        self
    }

    /// Sets the sliding-window rate limit.
    #[must_use]
    pub fn rate(mut self, window: Duration, max_submits: usize) -> Self {
        self.rate_window = window;
        self.rate_max_submits = max_submits;
        self
    }

    /// Sets the global disk budget.
    #[must_use]
    pub fn disk_budget_bytes(mut self, bytes: u64) -> Self {
        self.disk_budget_bytes = bytes;
        self
    }

    /// Sets the reservation used for transfers of unknown size.
    #[must_use]
    pub fn default_reservation_bytes(mut self, bytes: u64) -> Self {
        self.default_reservation_bytes = bytes;
        self
    }
}

#[derive(Debug)]
struct Reservation {
    owner: i64,
    bytes: u64,
}

#[derive(Debug, Default)]
struct GovernorState {
    /// Non-terminal transfer count per owner
    active_by_owner: HashMap<i64, usize>,
    /// Submission timestamps inside the sliding window, per owner
    submit_times: HashMap<i64, VecDeque<Instant>>,
    /// Byte reservation per transfer id
    reservations: HashMap<String, Reservation>,
    /// Sum of all reservations
    reserved_total: u64,
}

/// Tracks per-owner concurrency, submission rate, and the global disk
/// budget; admits or defers new work.
pub struct Governor {
    limits: GovernorLimits,
    state: Mutex<GovernorState>,
}

impl Governor {
    /// Creates a governor with the given limits.
    pub fn new(limits: GovernorLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(GovernorState::default()),
        }
    }

    /// Decides whether a new transfer may enter the system.
    ///
    /// On success the owner's slot, the rate-window entry and the byte
    /// reservation are all committed atomically under the state lock.
    ///
    /// # Arguments
    ///
    /// * `owner` - Requesting user/chat id
    /// * `transfer_id` - Pre-allocated id the reservation is keyed by
    /// * `declared_bytes` - Declared size; a conservative default is
    ///   reserved when absent
    pub async fn try_admit(&self, owner: i64, transfer_id: &str, declared_bytes: Option<u64>) -> Result<(), Deny> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let window = self.limits.rate_window;
        let times = state.submit_times.entry(owner).or_default();
        while times.front().is_some_and(|t| now.duration_since(*t) > window) {
            times.pop_front();
        }
        if times.len() >= self.limits.rate_max_submits {
            return Err(Deny::RateLimited);
        }

        let active = state.active_by_owner.get(&owner).copied().unwrap_or(0);
        if active >= self.limits.per_owner_max_active {
            return Err(Deny::PerUserLimit);
        }

        let reservation = declared_bytes.unwrap_or(self.limits.default_reservation_bytes);
        if state.reserved_total.saturating_add(reservation) > self.limits.disk_budget_bytes {
            return Err(Deny::GlobalDiskBudget);
        }

        // Commit
        state.submit_times.entry(owner).or_default().push_back(now);
        *state.active_by_owner.entry(owner).or_insert(0) += 1;
        state.reserved_total += reservation;
        state.reservations.insert(
            transfer_id.to_string(),
            Reservation {
                owner,
                bytes: reservation,
            },
        );
        Ok(())
    }

    /// Re-checks actual bytes written against the global budget at a chunk
    /// boundary.
    ///
    /// Declared sizes are provisional: when the actual count grows past the
    /// reservation, the reservation is raised to match (the bytes are
    /// already on disk), and the answer is `Pause` once the total overruns
    /// the budget. Pausing never fails the transfer.
    pub async fn charge(&self, transfer_id: &str, bytes_now: u64) -> BudgetDecision {
        let mut state = self.state.lock().await;

        let Some(current) = state.reservations.get(transfer_id).map(|r| r.bytes) else {
            // Unknown reservation (post-restart race); do not block the worker
            return BudgetDecision::Within;
        };

        if bytes_now > current {
            let delta = bytes_now - current;
            state.reserved_total += delta;
            if let Some(r) = state.reservations.get_mut(transfer_id) {
                r.bytes = bytes_now;
            }
        }

        if state.reserved_total > self.limits.disk_budget_bytes {
            BudgetDecision::Pause
        } else {
            BudgetDecision::Within
        }
    }

    /// Releases the reservation and owner slot of a transfer that reached a
    /// terminal state.
    pub async fn release(&self, transfer_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(reservation) = state.reservations.remove(transfer_id) {
            state.reserved_total = state.reserved_total.saturating_sub(reservation.bytes);
            if let Some(count) = state.active_by_owner.get_mut(&reservation.owner) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.active_by_owner.remove(&reservation.owner);
                }
            }
        }
    }

    /// True while the reserved total sits under the budget; the paused
    /// re-check task uses this to decide whether un-parking is worth trying.
    pub async fn has_free_budget(&self) -> bool {
        let state = self.state.lock().await;
        state.reserved_total < self.limits.disk_budget_bytes
    }

    /// Rebuilds reservations and owner slots from the store after a restart.
    ///
    /// Rate-window history is deliberately not restored; a restart opens a
    /// fresh window.
    pub async fn rebuild(&self, active_transfers: &[Transfer]) {
        let mut state = self.state.lock().await;
        state.active_by_owner.clear();
        state.reservations.clear();
        state.reserved_total = 0;

        for transfer in active_transfers {
            let bytes = transfer
                .total_bytes
                .unwrap_or(self.limits.default_reservation_bytes)
                .max(transfer.bytes_transferred);
            *state.active_by_owner.entry(transfer.owner).or_insert(0) += 1;
            state.reserved_total += bytes;
            state.reservations.insert(
                transfer.id.clone(),
                Reservation {
                    owner: transfer.owner,
                    bytes,
                },
            );
        }
    }

    /// Currently reserved bytes (observability hook).
    pub async fn reserved_bytes(&self) -> u64 {
        self.state.lock().await.reserved_total
    }

    /// Non-terminal transfer count for an owner.
    pub async fn active_count(&self, owner: i64) -> usize {
        self.state.lock().await.active_by_owner.get(&owner).copied().unwrap_or(0)
    }
}
