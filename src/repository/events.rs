//! Change events and the listener trait
//!
//! Events are immutable values: each carries the record snapshot before and
//! after one change, so listeners never need to call back into the
//! repository to learn what happened.

use crate::clock::Timestamp;
use crate::repository::id::ReplicaId;
use crate::repository::record::CacheEntry;
use crate::repository::state::EntryState;
use serde::{Deserialize, Serialize};

/// A record moved from one lifecycle state to another, or its flags changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeEvent {
    pub id: ReplicaId,
    pub old_entry: CacheEntry,
    pub new_entry: CacheEntry,
    pub timestamp: Timestamp,
}

impl StateChangeEvent {
    pub fn old_state(&self) -> EntryState {
        self.old_entry.state
    }

    pub fn new_state(&self) -> EntryState {
        self.new_entry.state
    }
}

/// A record's access time was updated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTimeChangeEvent {
    pub id: ReplicaId,
    pub old_entry: CacheEntry,
    pub new_entry: CacheEntry,
    pub timestamp: Timestamp,
}

/// A record's pin set changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickyChangeEvent {
    pub id: ReplicaId,
    pub old_entry: CacheEntry,
    pub new_entry: CacheEntry,
    pub timestamp: Timestamp,
}

/// What the repository did about an absorbed fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultAction {
    /// Data could not be deleted after the record was destroyed
    Leaked,
    /// The record was marked broken
    MarkedBroken,
}

/// A fault the repository absorbed instead of returning to a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultEvent {
    pub id: Option<ReplicaId>,
    pub action: FaultAction,
    pub message: String,
    pub timestamp: Timestamp,
}

/// Any event delivered through the notifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryEvent {
    State(StateChangeEvent),
    AccessTime(AccessTimeChangeEvent),
    Sticky(StickyChangeEvent),
    Fault(FaultEvent),
}

impl RepositoryEvent {
    pub fn id(&self) -> Option<&ReplicaId> {
        match self {
            RepositoryEvent::State(e) => Some(&e.id),
            RepositoryEvent::AccessTime(e) => Some(&e.id),
            RepositoryEvent::Sticky(e) => Some(&e.id),
            RepositoryEvent::Fault(e) => e.id.as_ref(),
        }
    }
}

/// Receiver of repository events
///
/// Callbacks run on the notifier's delivery task (or inline in synchronous
/// mode). A panicking callback is logged and skipped; it does not stop
/// delivery to other listeners.
pub trait StateChangeListener: Send + Sync + 'static {
    fn state_changed(&self, event: &StateChangeEvent);

    fn access_time_changed(&self, _event: &AccessTimeChangeEvent) {}

    fn sticky_changed(&self, _event: &StickyChangeEvent) {}

    fn fault_occurred(&self, _event: &FaultEvent) {}
}

/// Route one event to the matching callback
pub(crate) fn dispatch(listener: &dyn StateChangeListener, event: &RepositoryEvent) {
    match event {
        RepositoryEvent::State(e) => listener.state_changed(e),
        RepositoryEvent::AccessTime(e) => listener.access_time_changed(e),
        RepositoryEvent::Sticky(e) => listener.sticky_changed(e),
        RepositoryEvent::Fault(e) => listener.fault_occurred(e),
    }
}
