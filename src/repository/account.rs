//! Space accounting
//!
//! The accountant is the one shared mutable resource touched by writers
//! (allocate/free) and by state changes (precious/cached reclassification).
//! All counters live behind a single mutex and every operation is one
//! critical section, so no caller ever reads a counter and writes it back in
//! a separate step.
//!
//! ## Invariants
//!
//! - `used <= total`
//! - `precious + removable <= used` (a byte is classified at most once)
//! - hence `free + precious + removable <= total`
//!
//! Classification is kept per replica: [`SpaceAccountant::update`] replaces
//! whatever a replica contributed before with what its latest snapshot says.

use crate::clock::Timestamp;
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::record::CacheEntry;
use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::Notify;

/// Upper bound for the derived gap
pub const DEFAULT_GAP_CAP: u64 = 4 * 1024 * 1024 * 1024;

/// Immutable snapshot of pool space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub total: u64,
    pub free: u64,
    pub precious: u64,
    pub removable: u64,
    /// Space the pool tries to keep free
    pub gap: u64,
    /// Last access of the least recently used removable replica
    pub lru: Option<Timestamp>,
}

impl SpaceRecord {
    pub fn used(&self) -> u64 {
        self.total - self.free
    }

    /// How long the least recently used removable replica has been idle
    pub fn lru_age(&self, now: Timestamp) -> Duration {
        self.lru
            .map(|t| now.saturating_sub(t))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Default)]
struct AccountState {
    total: u64,
    used: u64,
    precious: u64,
    removable: u64,
    precious_entries: AHashMap<ReplicaId, u64>,
    removable_entries: AHashMap<ReplicaId, (u64, Timestamp)>,
    lru: BTreeSet<(Timestamp, ReplicaId)>,
}

impl AccountState {
    fn free(&self) -> u64 {
        self.total - self.used
    }

    fn unclassify(&mut self, id: &ReplicaId) {
        if let Some(size) = self.precious_entries.remove(id) {
            self.precious -= size;
        }
        if let Some((size, atime)) = self.removable_entries.remove(id) {
            self.removable -= size;
            self.lru.remove(&(atime, id.clone()));
        }
    }
}

/// Tracks total, used, precious and removable bytes of one pool
#[derive(Debug)]
pub struct SpaceAccountant {
    state: Mutex<AccountState>,
    gap: Option<u64>,
    freed: Notify,
}

impl SpaceAccountant {
    /// New accountant for a pool of `total` bytes. Without an explicit gap
    /// the gap is `min(total / 4, 4 GiB)`.
    pub fn new(total: u64, gap: Option<u64>) -> Self {
        SpaceAccountant {
            state: Mutex::new(AccountState {
                total,
                ..AccountState::default()
            }),
            gap,
            freed: Notify::new(),
        }
    }

    /// Reserve `n` bytes, all or nothing
    pub fn allocate(&self, n: u64) -> Result<(), RepositoryError> {
        let mut state = self.state.lock();
        let free = state.free();
        if n > free {
            return Err(RepositoryError::NoSpace { requested: n, free });
        }
        state.used += n;
        Ok(())
    }

    /// Reserve `n` bytes, waiting for space to be freed if necessary.
    ///
    /// Fails immediately only if `n` exceeds the pool size.
    pub async fn allocate_wait(&self, n: u64) -> Result<(), RepositoryError> {
        loop {
            let notified = self.freed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.allocate(n) {
                Ok(()) => return Ok(()),
                Err(RepositoryError::NoSpace { free, .. }) => {
                    let total = self.state.lock().total;
                    if n > total {
                        return Err(RepositoryError::NoSpace { requested: n, free });
                    }
                }
                Err(e) => return Err(e),
            }

            notified.await;
        }
    }

    /// Return `n` bytes to the pool
    pub fn free(&self, n: u64) {
        if n == 0 {
            return;
        }
        {
            let mut state = self.state.lock();
            debug_assert!(n <= state.used, "freeing {} of {} used bytes", n, state.used);
            state.used = state.used.saturating_sub(n);
        }
        self.freed.notify_waiters();
    }

    /// Resize the pool; fails if the new size is below the space in use
    pub fn set_total(&self, total: u64) -> Result<(), RepositoryError> {
        {
            let mut state = self.state.lock();
            if total < state.used {
                return Err(RepositoryError::Resource(format!(
                    "cannot shrink pool to {} bytes, {} bytes in use",
                    total, state.used
                )));
            }
            state.total = total;
        }
        self.freed.notify_waiters();
        Ok(())
    }

    /// Reclassify one replica according to its latest snapshot
    pub fn update(&self, entry: &CacheEntry) {
        let mut state = self.state.lock();
        state.unclassify(&entry.id);
        if entry.is_precious() {
            state.precious += entry.size;
            state.precious_entries.insert(entry.id.clone(), entry.size);
        } else if entry.is_removable() {
            state.removable += entry.size;
            state
                .removable_entries
                .insert(entry.id.clone(), (entry.size, entry.last_access));
            state.lru.insert((entry.last_access, entry.id.clone()));
        }
        debug_assert!(
            state.precious + state.removable <= state.used,
            "classified bytes exceed used bytes"
        );
    }

    pub fn snapshot(&self) -> SpaceRecord {
        let state = self.state.lock();
        let gap = self
            .gap
            .unwrap_or_else(|| (state.total / 4).min(DEFAULT_GAP_CAP));
        SpaceRecord {
            total: state.total,
            free: state.free(),
            precious: state.precious,
            removable: state.removable,
            gap,
            lru: state.lru.iter().next().map(|(t, _)| *t),
        }
    }

    /// Verify the accounting invariants (for DST and debugging)
    pub fn check_invariants(&self) -> Result<(), String> {
        let state = self.state.lock();
        if state.used > state.total {
            return Err(format!("used {} exceeds total {}", state.used, state.total));
        }
        if state.precious + state.removable > state.used {
            return Err(format!(
                "precious {} + removable {} exceeds used {}",
                state.precious, state.removable, state.used
            ));
        }
        let precious: u64 = state.precious_entries.values().sum();
        let removable: u64 = state.removable_entries.values().map(|(s, _)| s).sum();
        if precious != state.precious || removable != state.removable {
            return Err("per-replica classification out of sync with counters".to_string());
        }
        if state.lru.len() != state.removable_entries.len() {
            return Err("LRU index out of sync with removable set".to_string());
        }
        Ok(())
    }
}
