//! Sticky records (pins)
//!
//! A pin is a named, optionally time-limited hold that keeps a replica from
//! being evicted. Every owner has at most one pin per replica; owners never
//! interfere with each other's pins. The registry lives inside the record
//! metadata and is therefore guarded by the record lock.

use crate::clock::Timestamp;
use serde::{Deserialize, Serialize};

/// When a pin lapses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expiry {
    Never,
    At(Timestamp),
}

impl Expiry {
    /// Whether a pin with this expiry still holds at `now`
    pub fn is_valid(&self, now: Timestamp) -> bool {
        match self {
            Expiry::Never => true,
            Expiry::At(t) => *t > now,
        }
    }
}

/// One owner's pin on a replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StickyRecord {
    pub owner: String,
    pub expire: Expiry,
}

impl StickyRecord {
    pub fn new(owner: impl Into<String>, expire: Expiry) -> Self {
        StickyRecord {
            owner: owner.into(),
            expire,
        }
    }

    pub fn is_valid(&self, now: Timestamp) -> bool {
        self.expire.is_valid(now)
    }
}

/// Set of pins on one replica, at most one per owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StickyRegistry {
    records: Vec<StickyRecord>,
}

impl StickyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace `owner`'s pin.
    ///
    /// If `owner` holds a pin that is still valid and `overwrite` is false,
    /// nothing changes. A pin whose expiry is already in the past removes
    /// `owner`'s pin. Returns whether the registry changed.
    pub fn add_record(
        &mut self,
        owner: &str,
        expire: Expiry,
        overwrite: bool,
        now: Timestamp,
    ) -> bool {
        let existing = self.records.iter().position(|r| r.owner == owner);

        if let Some(pos) = existing {
            if !overwrite && self.records[pos].is_valid(now) {
                return false;
            }
            if self.records[pos].expire == expire && expire.is_valid(now) {
                return false;
            }
            self.records.swap_remove(pos);
        }

        if expire.is_valid(now) {
            self.records.push(StickyRecord::new(owner, expire));
            true
        } else {
            existing.is_some()
        }
    }

    /// Drop `owner`'s pin. Returns the removed pin, if any.
    pub fn remove_owner(&mut self, owner: &str) -> Option<StickyRecord> {
        let pos = self.records.iter().position(|r| r.owner == owner)?;
        Some(self.records.swap_remove(pos))
    }

    /// Drop every pin that lapsed at or before `now` and return them
    pub fn remove_expired(&mut self, now: Timestamp) -> Vec<StickyRecord> {
        let mut removed = Vec::new();
        self.records.retain(|r| {
            if r.is_valid(now) {
                true
            } else {
                removed.push(r.clone());
                false
            }
        });
        removed
    }

    /// True iff at least one pin is currently valid
    pub fn is_sticky(&self, now: Timestamp) -> bool {
        self.records.iter().any(|r| r.is_valid(now))
    }

    /// True iff any pin is registered, lapsed or not
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Earliest expiry among time-limited pins
    pub fn next_expiry(&self) -> Option<Timestamp> {
        self.records
            .iter()
            .filter_map(|r| match r.expire {
                Expiry::At(t) => Some(t),
                Expiry::Never => None,
            })
            .min()
    }

    pub fn records(&self) -> &[StickyRecord] {
        &self.records
    }
}
