//! Replica lifecycle states
//!
//! ```text
//!   NEW ──► FROM_CLIENT ─┐ commit ┌─► PRECIOUS ─┐
//!       └─► FROM_STORE ──┘        └─► CACHED  ──┴─► REMOVED ──► DESTROYED
//! ```
//!
//! `PRECIOUS` and `CACHED` may be switched back and forth by the eviction
//! policy. Orthogonal to the state, a record carries [`RecordFlags`]; the
//! `BROKEN` flag can be raised at any point after creation.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryState {
    /// Created, no writer attached yet
    New,
    /// Being written with bytes arriving from a client
    FromClient,
    /// Being written with bytes staged from a nearline store
    FromStore,
    /// Committed, already durable elsewhere, evictable once unpinned
    Cached,
    /// Committed, must be flushed to nearline storage before eviction
    Precious,
    /// Logically deleted, waiting for the last handle to go away
    Removed,
    /// Terminal, purged from the store
    Destroyed,
}

impl EntryState {
    /// True while the replica is still being written
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            EntryState::New | EntryState::FromClient | EntryState::FromStore
        )
    }

    /// True once the replica has been committed and not yet removed
    pub fn is_committed(&self) -> bool {
        matches!(self, EntryState::Cached | EntryState::Precious)
    }

    /// True for states that are gone or going away
    pub fn is_removed(&self) -> bool {
        matches!(self, EntryState::Removed | EntryState::Destroyed)
    }

    /// Whether the state machine permits `self -> to`
    ///
    /// Leaving `FROM_CLIENT`/`FROM_STORE` for a committed state is only
    /// reachable through `WriteHandle::commit`, which validates size and
    /// checksum first; this table only says the edge exists.
    pub fn can_transition_to(&self, to: EntryState) -> bool {
        use EntryState::*;
        match (self, to) {
            (New, FromClient) | (New, FromStore) | (New, Removed) => true,
            (FromClient, Cached) | (FromClient, Precious) | (FromClient, Removed) => true,
            (FromStore, Cached) | (FromStore, Precious) | (FromStore, Removed) => true,
            (Cached, Precious) | (Cached, Removed) => true,
            (Precious, Cached) | (Precious, Removed) => true,
            (Removed, Destroyed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntryState::New => "NEW",
            EntryState::FromClient => "FROM_CLIENT",
            EntryState::FromStore => "FROM_STORE",
            EntryState::Cached => "CACHED",
            EntryState::Precious => "PRECIOUS",
            EntryState::Removed => "REMOVED",
            EntryState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// Where the bytes of a new replica come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// Uploaded by a client; not yet on nearline storage
    Client,
    /// Staged from a nearline store; already durable there
    Store,
}

impl Provenance {
    /// The in-flight state a record takes while being written
    pub fn transfer_state(&self) -> EntryState {
        match self {
            Provenance::Client => EntryState::FromClient,
            Provenance::Store => EntryState::FromStore,
        }
    }

    /// The committed state a record takes unless told otherwise
    pub fn default_target(&self) -> EntryState {
        match self {
            Provenance::Client => EntryState::Precious,
            Provenance::Store => EntryState::Cached,
        }
    }
}

/// Small bitset of flags orthogonal to [`EntryState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// Integrity check failed or the write was abandoned
    pub const BROKEN: RecordFlags = RecordFlags(0b01);
    /// At least one pin is registered
    pub const STICKY: RecordFlags = RecordFlags(0b10);

    pub const fn empty() -> Self {
        RecordFlags(0)
    }

    pub fn contains(&self, other: RecordFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RecordFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: RecordFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: RecordFlags, value: bool) {
        if value {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}
