//! Replica records
//!
//! A record is the metadata of one replica (state, flags, size, pins,
//! checksums, access time, open-handle counts) guarded by a per-record lock,
//! plus access to the replica's bytes. All transitions on one record are
//! serialised by that lock; records never share a lock with each other.
//!
//! [`RecordMeta`] is the state machine itself and knows nothing about
//! accounting or notification; the repository wraps every mutation with a
//! before/after [`CacheEntry`] snapshot and publishes the difference.

use crate::clock::Timestamp;
use crate::repository::channel::{ChannelOptions, RepositoryChannel};
use crate::repository::checksum::{Checksum, ChecksumType};
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::state::{EntryState, RecordFlags};
use crate::repository::sticky::{StickyRecord, StickyRegistry};
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};

/// One replica as seen through a store
///
/// Stores hand out `Arc<dyn ReplicaRecord>`; decorators (see
/// `ChecksumReplicaRecord`) wrap a record and forward the metadata lock so
/// every layer observes the same state.
pub trait ReplicaRecord: Send + Sync + 'static {
    fn id(&self) -> &ReplicaId;

    /// Take the per-record lock
    fn meta(&self) -> MutexGuard<'_, RecordMeta>;

    /// Open a byte channel onto the replica data
    fn open_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Box<dyn RepositoryChannel>, RepositoryError>;
}

/// Mutable metadata of one replica
#[derive(Debug, Clone)]
pub struct RecordMeta {
    state: EntryState,
    flags: RecordFlags,
    /// Bytes accounted to this replica. Grows with each allocation while
    /// the write is open, fixed to the data length on commit.
    size: u64,
    sticky: StickyRegistry,
    checksums: Vec<Checksum>,
    created_at: Timestamp,
    last_access: Timestamp,
    readers: u32,
    writer: bool,
}

impl RecordMeta {
    pub fn new(now: Timestamp) -> Self {
        RecordMeta {
            state: EntryState::New,
            flags: RecordFlags::empty(),
            size: 0,
            sticky: StickyRegistry::new(),
            checksums: Vec::new(),
            created_at: now,
            last_access: now,
            readers: 0,
            writer: false,
        }
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    /// Move to `to` if the lifecycle permits it
    pub fn set_state(&mut self, id: &ReplicaId, to: EntryState) -> Result<(), RepositoryError> {
        if !self.state.can_transition_to(to) {
            return Err(RepositoryError::IllegalTransition {
                id: id.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn is_broken(&self) -> bool {
        self.flags.contains(RecordFlags::BROKEN)
    }

    pub fn set_broken(&mut self, broken: bool) {
        self.flags.set(RecordFlags::BROKEN, broken);
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn sticky(&self) -> &StickyRegistry {
        &self.sticky
    }

    /// Mutate the pin set; keeps the `STICKY` flag in step
    pub fn update_sticky<T>(&mut self, f: impl FnOnce(&mut StickyRegistry) -> T) -> T {
        let result = f(&mut self.sticky);
        let pinned = !self.sticky.is_empty();
        self.flags.set(RecordFlags::STICKY, pinned);
        result
    }

    pub fn checksums(&self) -> &[Checksum] {
        &self.checksums
    }

    pub fn checksum(&self, kind: ChecksumType) -> Option<&Checksum> {
        self.checksums.iter().find(|c| c.kind == kind)
    }

    /// Record a checksum unless one of the same type is already known.
    /// Known checksums are fixed for the lifetime of the record.
    pub fn add_checksum(&mut self, checksum: Checksum) -> bool {
        if self.checksum(checksum.kind).is_some() {
            return false;
        }
        self.checksums.push(checksum);
        true
    }

    pub fn last_access(&self) -> Timestamp {
        self.last_access
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.last_access = now;
    }

    pub fn readers(&self) -> u32 {
        self.readers
    }

    pub fn add_reader(&mut self) {
        self.readers = self.readers.saturating_add(1);
    }

    pub fn remove_reader(&mut self) {
        debug_assert!(self.readers > 0, "reader count underflow");
        self.readers = self.readers.saturating_sub(1);
    }

    pub fn has_writer(&self) -> bool {
        self.writer
    }

    pub fn set_writer(&mut self, open: bool) {
        self.writer = open;
    }

    /// No handle of any kind is open
    pub fn is_idle(&self) -> bool {
        self.readers == 0 && !self.writer
    }

    /// Immutable view of the record at `now`
    pub fn snapshot(&self, id: &ReplicaId, now: Timestamp) -> CacheEntry {
        CacheEntry {
            id: id.clone(),
            state: self.state,
            broken: self.is_broken(),
            size: self.size,
            sticky: self.sticky.is_sticky(now),
            sticky_records: self.sticky.records().to_vec(),
            checksums: self.checksums.clone(),
            created_at: self.created_at,
            last_access: self.last_access,
            open_handles: self.readers + u32::from(self.writer),
        }
    }
}

/// Point-in-time view of a record, as handed to callers and listeners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: ReplicaId,
    pub state: EntryState,
    pub broken: bool,
    pub size: u64,
    /// At least one pin was valid when the snapshot was taken
    pub sticky: bool,
    /// Registered pins, including lapsed ones not yet swept
    pub sticky_records: Vec<StickyRecord>,
    pub checksums: Vec<Checksum>,
    pub created_at: Timestamp,
    pub last_access: Timestamp,
    pub open_handles: u32,
}

impl CacheEntry {
    /// Counted as removable space: cached, intact and unpinned.
    ///
    /// A lapsed pin keeps holding until `remove_expired_sticky` sweeps it,
    /// so removable space only grows in the sweep's accounting step.
    pub fn is_removable(&self) -> bool {
        self.state == EntryState::Cached && !self.broken && self.sticky_records.is_empty()
    }

    /// Counted as precious space
    pub fn is_precious(&self) -> bool {
        self.state == EntryState::Precious
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::sticky::Expiry;

    fn id() -> ReplicaId {
        ReplicaId::from_u64(1)
    }

    #[test]
    fn test_new_record() {
        let meta = RecordMeta::new(Timestamp(5));
        let entry = meta.snapshot(&id(), Timestamp(5));
        assert_eq!(entry.state, EntryState::New);
        assert_eq!(entry.size, 0);
        assert!(!entry.broken);
        assert_eq!(entry.created_at, Timestamp(5));
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut meta = RecordMeta::new(Timestamp(0));
        let err = meta.set_state(&id(), EntryState::Cached).unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::IllegalTransition {
                from: EntryState::New,
                to: EntryState::Cached,
                ..
            }
        ));
        assert_eq!(meta.state(), EntryState::New);
    }

    #[test]
    fn test_sticky_flag_tracks_registry() {
        let mut meta = RecordMeta::new(Timestamp(0));
        meta.update_sticky(|s| s.add_record("pin", Expiry::Never, false, Timestamp(0)));
        assert!(meta.flags.contains(RecordFlags::STICKY));
        meta.update_sticky(|s| s.remove_owner("pin"));
        assert!(!meta.flags.contains(RecordFlags::STICKY));
    }

    #[test]
    fn test_known_checksum_is_fixed() {
        let mut meta = RecordMeta::new(Timestamp(0));
        let first = Checksum::new(ChecksumType::Crc32, "0000abcd");
        let second = Checksum::new(ChecksumType::Crc32, "ffff0000");
        assert!(meta.add_checksum(first.clone()));
        assert!(!meta.add_checksum(second));
        assert_eq!(meta.checksum(ChecksumType::Crc32), Some(&first));
    }

    #[test]
    fn test_removable_classification() {
        let mut meta = RecordMeta::new(Timestamp(0));
        meta.set_state(&id(), EntryState::FromStore).unwrap();
        meta.set_state(&id(), EntryState::Cached).unwrap();
        assert!(meta.snapshot(&id(), Timestamp(0)).is_removable());

        meta.update_sticky(|s| s.add_record("pin", Expiry::At(Timestamp(10)), false, Timestamp(0)));
        assert!(!meta.snapshot(&id(), Timestamp(0)).is_removable());
        // Lapsed, but still registered
        let later = meta.snapshot(&id(), Timestamp(20));
        assert!(!later.sticky);
        assert!(!later.is_removable());

        meta.update_sticky(|s| s.remove_expired(Timestamp(20)));
        meta.set_broken(true);
        assert!(!meta.snapshot(&id(), Timestamp(20)).is_removable());
    }

    #[test]
    fn test_open_handle_count() {
        let mut meta = RecordMeta::new(Timestamp(0));
        meta.set_writer(true);
        meta.add_reader();
        assert_eq!(meta.snapshot(&id(), Timestamp(0)).open_handles, 2);
        assert!(!meta.is_idle());
        meta.set_writer(false);
        meta.remove_reader();
        assert!(meta.is_idle());
    }
}
