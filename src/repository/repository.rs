//! Replica repository facade
//!
//! `ReplicaRepository` is what the eviction/migration policy, the HSM
//! engines and the transfer movers talk to. It ties together the store, the
//! space accountant and the notifier, and it is the only place that moves
//! records through their lifecycle.
//!
//! ## Locking
//!
//! Every mutation of a record happens under that record's lock, and the
//! accounting update and event submission for the mutation happen before the
//! lock is released. Per-record transitions are therefore totally ordered,
//! and listeners see them in the order they happened. Lock order is
//! record -> store shard -> accountant; nothing takes them the other way.

use crate::clock::{Clock, Timestamp};
use crate::config::{AbortPolicy, RepositoryConfig, StoreConfig};
use crate::repository::account::{SpaceAccountant, SpaceRecord};
use crate::repository::channel::ChannelOptions;
use crate::repository::checksum::{digest_channel, Checksum, ChecksumReplicaStore};
use crate::repository::error::RepositoryError;
use crate::repository::events::{
    AccessTimeChangeEvent, FaultAction, FaultEvent, RepositoryEvent, StateChangeEvent,
    StateChangeListener, StickyChangeEvent,
};
use crate::repository::expiration::ExpirationWorker;
use crate::repository::file_store::FileReplicaStore;
use crate::repository::handle::{ReadHandle, WriteHandle};
use crate::repository::id::ReplicaId;
use crate::repository::memory_store::MemoryReplicaStore;
use crate::repository::notifier::StateChangeNotifier;
use crate::repository::record::{CacheEntry, RecordMeta, ReplicaRecord};
use crate::repository::state::{EntryState, Provenance};
use crate::repository::sticky::{Expiry, StickyRecord};
use crate::repository::store::ReplicaStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a new replica is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub provenance: Provenance,
    /// Committed state; defaults to the provenance's usual target
    pub target: Option<EntryState>,
    /// Pins applied atomically with the commit
    pub sticky: Vec<StickyRecord>,
    /// Checksum already known for the data, e.g. from the namespace
    pub checksum: Option<Checksum>,
}

impl CreateOptions {
    pub fn from_client() -> Self {
        Self::new(Provenance::Client)
    }

    pub fn from_store() -> Self {
        Self::new(Provenance::Store)
    }

    pub fn new(provenance: Provenance) -> Self {
        CreateOptions {
            provenance,
            target: None,
            sticky: Vec::new(),
            checksum: None,
        }
    }

    pub fn with_target(mut self, target: EntryState) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_sticky(mut self, owner: impl Into<String>, expire: Expiry) -> Self {
        self.sticky.push(StickyRecord::new(owner, expire));
        self
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn target_state(&self) -> EntryState {
        self.target
            .unwrap_or_else(|| self.provenance.default_target())
    }
}

/// Options for opening a replica for reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Leave the access time (and thus the LRU order) untouched
    pub no_atime: bool,
}

impl OpenFlags {
    pub const NONE: OpenFlags = OpenFlags { no_atime: false };
    pub const NO_ATIME: OpenFlags = OpenFlags { no_atime: true };
}

// ============================================================================
// RepositoryCore
// ============================================================================

/// State shared by the repository and the handles it hands out
pub(crate) struct RepositoryCore {
    store: Arc<dyn ReplicaStore>,
    account: SpaceAccountant,
    notifier: StateChangeNotifier,
    clock: Arc<dyn Clock>,
    config: RepositoryConfig,
    closed: AtomicBool,
}

impl RepositoryCore {
    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn account(&self) -> &SpaceAccountant {
        &self.account
    }

    pub(crate) fn abort_policy(&self) -> AbortPolicy {
        self.config.abort_policy
    }

    pub(crate) fn ensure_open(&self) -> Result<(), RepositoryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RepositoryError::state("repository has been shut down"));
        }
        Ok(())
    }

    /// Account for and announce one state change. Caller holds the record lock.
    pub(crate) fn publish_state(&self, old: CacheEntry, new: CacheEntry) {
        self.account.update(&new);
        self.notifier.submit(RepositoryEvent::State(StateChangeEvent {
            id: new.id.clone(),
            old_entry: old,
            new_entry: new,
            timestamp: self.now(),
        }));
    }

    fn publish_sticky(&self, old: CacheEntry, new: CacheEntry) {
        self.account.update(&new);
        self.notifier.submit(RepositoryEvent::Sticky(StickyChangeEvent {
            id: new.id.clone(),
            old_entry: old,
            new_entry: new,
            timestamp: self.now(),
        }));
    }

    fn publish_access(&self, old: CacheEntry, new: CacheEntry) {
        self.account.update(&new);
        self.notifier
            .submit(RepositoryEvent::AccessTime(AccessTimeChangeEvent {
                id: new.id.clone(),
                old_entry: old,
                new_entry: new,
                timestamp: self.now(),
            }));
    }

    pub(crate) fn report_fault(
        &self,
        id: Option<&ReplicaId>,
        action: FaultAction,
        message: String,
    ) {
        self.notifier.submit(RepositoryEvent::Fault(FaultEvent {
            id: id.cloned(),
            action,
            message,
            timestamp: self.now(),
        }));
    }

    /// Move a locked record to `to` and publish the change
    pub(crate) fn transition(
        &self,
        record: &dyn ReplicaRecord,
        meta: &mut RecordMeta,
        to: EntryState,
    ) -> Result<CacheEntry, RepositoryError> {
        let now = self.now();
        let old = meta.snapshot(record.id(), now);
        meta.set_state(record.id(), to)?;
        let new = meta.snapshot(record.id(), now);
        self.publish_state(old, new.clone());
        Ok(new)
    }

    /// Change flags or size of a locked record and publish the change
    pub(crate) fn update(
        &self,
        record: &dyn ReplicaRecord,
        meta: &mut RecordMeta,
        f: impl FnOnce(&mut RecordMeta),
    ) -> CacheEntry {
        let now = self.now();
        let old = meta.snapshot(record.id(), now);
        f(meta);
        let new = meta.snapshot(record.id(), now);
        self.publish_state(old, new.clone());
        new
    }

    /// Purge a locked, removed record that no handle refers to any more
    pub(crate) fn destroy(&self, record: &dyn ReplicaRecord, meta: &mut RecordMeta) {
        let id = record.id();
        debug_assert!(meta.is_idle(), "destroying {} with open handles", id);
        let size = meta.size();
        if let Err(e) = self.transition(record, meta, EntryState::Destroyed) {
            error!("Failed to destroy {}: {}", id, e);
            return;
        }
        self.account.free(size);
        if let Err(e) = self.store.remove(id) {
            warn!("Failed to delete data of {}: {}", id, e);
            self.report_fault(Some(id), FaultAction::Leaked, e.to_string());
        }
        debug!("Destroyed {} ({} bytes)", id, size);
    }
}

// ============================================================================
// ReplicaRepository
// ============================================================================

/// The replica repository of one pool
#[derive(Clone)]
pub struct ReplicaRepository {
    core: Arc<RepositoryCore>,
}

impl ReplicaRepository {
    /// Build a repository over `store`. In ordered notification mode this
    /// spawns the delivery task and must be called within a tokio runtime.
    pub fn new(
        config: RepositoryConfig,
        store: Arc<dyn ReplicaStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let account = SpaceAccountant::new(config.total_space, config.gap);
        let notifier = StateChangeNotifier::new(config.notification);
        info!(
            "Replica repository online: {} bytes, {:?} notification",
            config.total_space, config.notification
        );
        ReplicaRepository {
            core: Arc::new(RepositoryCore {
                store,
                account,
                notifier,
                clock,
                config,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Build the store described by the configuration, decorated with
    /// checksum computation when checksum types are configured
    pub fn from_config(
        config: RepositoryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RepositoryError> {
        let types = config.checksum.types.clone();
        let store: Arc<dyn ReplicaStore> = match &config.store {
            StoreConfig::InMemory => {
                let inner = MemoryReplicaStore::new();
                if types.is_empty() {
                    Arc::new(inner)
                } else {
                    Arc::new(ChecksumReplicaStore::new(inner, types))
                }
            }
            StoreConfig::LocalFs { path } => {
                let inner = FileReplicaStore::new(path)?;
                if types.is_empty() {
                    Arc::new(inner)
                } else {
                    Arc::new(ChecksumReplicaStore::new(inner, types))
                }
            }
        };
        Ok(Self::new(config, store, clock))
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.core.config
    }

    pub fn store(&self) -> &Arc<dyn ReplicaStore> {
        &self.core.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.core.clock
    }

    fn record(&self, id: &ReplicaId) -> Result<Arc<dyn ReplicaRecord>, RepositoryError> {
        self.core
            .store
            .get(id)
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    /// Create a new replica and open it for writing.
    ///
    /// The record enters the provenance's transfer state right away; it only
    /// becomes readable once the returned handle commits.
    pub fn create_entry(
        &self,
        id: &ReplicaId,
        options: CreateOptions,
    ) -> Result<WriteHandle, RepositoryError> {
        self.core.ensure_open()?;
        let target = options.target_state();
        if !target.is_committed() {
            return Err(RepositoryError::InvalidArgument(format!(
                "invalid target state {}",
                target
            )));
        }

        let record = self.core.store.create(id, self.core.now())?;
        info!("Creating new entry for {}", id);

        let options_for_channel =
            ChannelOptions::write().with_checksums(self.core.config.checksum.on_write);
        let mut meta = record.meta();
        if let Some(checksum) = options.checksum.clone() {
            meta.add_checksum(checksum);
        }
        meta.set_writer(true);
        self.core
            .transition(record.as_ref(), &mut meta, options.provenance.transfer_state())?;

        let channel = match record.open_channel(options_for_channel) {
            Ok(channel) => channel,
            Err(e) => {
                error!("Failed to open data of {}: {}", id, e);
                meta.set_writer(false);
                self.core
                    .transition(record.as_ref(), &mut meta, EntryState::Removed)?;
                self.core.destroy(record.as_ref(), &mut meta);
                return Err(e);
            }
        };
        drop(meta);

        Ok(WriteHandle::new(
            self.core.clone(),
            record,
            channel,
            target,
            options.sticky,
        ))
    }

    /// Open a committed replica for reading
    pub fn open_read(
        &self,
        id: &ReplicaId,
        flags: OpenFlags,
    ) -> Result<ReadHandle, RepositoryError> {
        self.core.ensure_open()?;
        let record = self.record(id)?;
        let mut meta = record.meta();
        let state = meta.state();
        if state.is_incomplete() {
            return Err(RepositoryError::state(format!("replica {} is incomplete", id)));
        }
        if state.is_removed() {
            return Err(RepositoryError::state(format!("replica {} has been removed", id)));
        }
        if meta.is_broken() {
            return Err(RepositoryError::state(format!("replica {} is broken", id)));
        }

        let channel = record.open_channel(ChannelOptions::read())?;
        meta.add_reader();

        if !flags.no_atime {
            let now = self.core.now();
            let old = meta.snapshot(id, now);
            meta.touch(now);
            let new = meta.snapshot(id, now);
            self.core.publish_access(old, new);
        }
        drop(meta);

        Ok(ReadHandle::new(self.core.clone(), record, channel))
    }

    /// Change the state of a committed replica.
    ///
    /// Only `CACHED`, `PRECIOUS` and `REMOVED` are valid targets. Removing a
    /// record that is missing or already removed succeeds without effect.
    /// A removed record is destroyed as soon as no handle refers to it.
    pub fn set_state(&self, id: &ReplicaId, to: EntryState) -> Result<(), RepositoryError> {
        self.core.ensure_open()?;
        let Some(record) = self.core.store.get(id) else {
            if to == EntryState::Removed {
                return Ok(());
            }
            return Err(RepositoryError::IllegalTransition {
                id: id.clone(),
                from: EntryState::New,
                to,
            });
        };

        let mut meta = record.meta();
        let from = meta.state();
        let allowed = match from {
            EntryState::New | EntryState::Removed | EntryState::Destroyed
                if to == EntryState::Removed =>
            {
                return Ok(());
            }
            EntryState::Cached | EntryState::Precious => {
                matches!(to, EntryState::Cached | EntryState::Precious | EntryState::Removed)
            }
            // Abandoned writes can only be cleaned up
            EntryState::FromClient | EntryState::FromStore => {
                meta.is_broken() && to == EntryState::Removed
            }
            _ => false,
        };
        if !allowed {
            return Err(RepositoryError::IllegalTransition {
                id: id.clone(),
                from,
                to,
            });
        }
        if from == to {
            return Ok(());
        }

        self.core.transition(record.as_ref(), &mut meta, to)?;
        if to == EntryState::Removed {
            info!("Removed {}", id);
            if meta.is_idle() {
                self.core.destroy(record.as_ref(), &mut meta);
            }
        }
        Ok(())
    }

    /// Create or replace `owner`'s pin on a replica. Returns whether the pin
    /// set changed.
    pub fn set_sticky(
        &self,
        id: &ReplicaId,
        owner: &str,
        expire: Expiry,
        overwrite: bool,
    ) -> Result<bool, RepositoryError> {
        self.core.ensure_open()?;
        let record = self.record(id)?;
        let mut meta = record.meta();
        let state = meta.state();
        if state.is_incomplete() {
            return Err(RepositoryError::state(format!("replica {} is incomplete", id)));
        }
        if state.is_removed() {
            return Err(RepositoryError::state(format!("replica {} has been removed", id)));
        }

        let now = self.core.now();
        let old = meta.snapshot(id, now);
        let changed = meta.update_sticky(|s| s.add_record(owner, expire, overwrite, now));
        if changed {
            let new = meta.snapshot(id, now);
            self.core.publish_sticky(old, new);
        }
        Ok(changed)
    }

    /// Drop every lapsed pin in the repository, returning what was dropped
    /// per replica
    pub fn remove_expired_sticky(&self) -> Vec<(ReplicaId, Vec<StickyRecord>)> {
        let now = self.core.now();
        let mut expired = Vec::new();
        for id in self.core.store.ids() {
            let Some(record) = self.core.store.get(&id) else {
                continue;
            };
            let mut meta = record.meta();
            if meta.sticky().is_empty() {
                continue;
            }
            let old = meta.snapshot(&id, now);
            let removed = meta.update_sticky(|s| s.remove_expired(now));
            if removed.is_empty() {
                continue;
            }
            let new = meta.snapshot(&id, now);
            self.core.publish_sticky(old, new);
            debug!("Expired {} pin(s) on {}", removed.len(), id);
            expired.push((id, removed));
        }
        expired
    }

    /// Re-read a committed replica and compare it against its checksums.
    ///
    /// A replica without a known checksum gets the configured types computed
    /// and stored. On mismatch the replica is marked broken.
    pub fn verify_checksum(&self, id: &ReplicaId) -> Result<Vec<Checksum>, RepositoryError> {
        let known = self.record(id)?.meta().checksums().to_vec();
        let kinds: Vec<_> = if known.is_empty() {
            self.core.config.checksum.types.clone()
        } else {
            known.iter().map(|c| c.kind).collect()
        };
        if kinds.is_empty() {
            return Ok(Vec::new());
        }

        let mut handle = self.open_read(id, OpenFlags::NO_ATIME)?;
        let computed = digest_channel(handle.channel_mut()?, &kinds);
        let record = handle.record().clone();
        handle.close()?;
        let computed = computed?;

        let mut meta = record.meta();
        if known.is_empty() {
            for checksum in &computed {
                meta.add_checksum(checksum.clone());
            }
            return Ok(computed);
        }

        for (expected, actual) in known.iter().zip(computed.iter()) {
            if expected != actual {
                warn!("Checksum mismatch for {}: expected {}, got {}", id, expected, actual);
                if !meta.state().is_removed() {
                    self.core
                        .update(record.as_ref(), &mut meta, |m| m.set_broken(true));
                    self.core.report_fault(
                        Some(id),
                        FaultAction::MarkedBroken,
                        format!("checksum mismatch: expected {}, got {}", expected, actual),
                    );
                }
                return Err(RepositoryError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }
        Ok(computed)
    }

    /// Flag a replica as broken (repair tooling)
    pub fn mark_broken(&self, id: &ReplicaId) -> Result<(), RepositoryError> {
        self.core.ensure_open()?;
        let record = self.record(id)?;
        let mut meta = record.meta();
        if meta.state().is_removed() {
            return Err(RepositoryError::state(format!("replica {} has been removed", id)));
        }
        if meta.is_broken() {
            return Ok(());
        }
        self.core
            .update(record.as_ref(), &mut meta, |m| m.set_broken(true));
        warn!("Marked {} as broken", id);
        Ok(())
    }

    pub fn get_space_record(&self) -> SpaceRecord {
        self.core.account.snapshot()
    }

    /// Resize the pool
    pub fn set_total_space(&self, total: u64) -> Result<(), RepositoryError> {
        self.core.account.set_total(total)?;
        info!("Pool size set to {} bytes", total);
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.core.notifier.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn StateChangeListener>) -> bool {
        self.core.notifier.remove_listener(listener)
    }

    pub fn state(&self, id: &ReplicaId) -> Result<EntryState, RepositoryError> {
        Ok(self.record(id)?.meta().state())
    }

    pub fn entry(&self, id: &ReplicaId) -> Result<CacheEntry, RepositoryError> {
        let record = self.record(id)?;
        let meta = record.meta();
        Ok(meta.snapshot(id, self.core.now()))
    }

    /// Snapshots of every record, including incomplete and broken ones
    pub fn entries(&self) -> Vec<CacheEntry> {
        let now = self.core.now();
        self.core
            .store
            .ids()
            .into_iter()
            .filter_map(|id| {
                let record = self.core.store.get(&id)?;
                let meta = record.meta();
                Some(meta.snapshot(&id, now))
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<ReplicaId> {
        self.core.store.ids()
    }

    /// Start the background task that sweeps lapsed pins every
    /// `sticky_sweep_interval`
    pub fn spawn_expiration_worker(&self) -> ExpirationWorker {
        ExpirationWorker::spawn(self.clone(), self.core.config.sticky_sweep_interval)
    }

    /// Wait until all events submitted so far have reached the listeners
    pub async fn flush(&self) {
        self.core.notifier.flush().await;
    }

    /// Stop accepting operations and drain the notifier
    pub async fn shutdown(&self) {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.notifier.shutdown().await;
        info!("Replica repository shut down");
    }

    /// Cross-check records against the accountant (for DST and debugging)
    pub fn check_invariants(&self) -> Result<(), String> {
        self.core.account.check_invariants()?;
        let space = self.core.account.snapshot();
        let mut accounted = 0u64;
        for id in self.core.store.ids() {
            let Some(record) = self.core.store.get(&id) else {
                continue;
            };
            let meta = record.meta();
            if meta.state() == EntryState::Destroyed {
                return Err(format!("destroyed record {} still in store", id));
            }
            if meta.state().is_incomplete() && !meta.has_writer() && !meta.is_broken() {
                return Err(format!("incomplete record {} has no writer", id));
            }
            accounted += meta.size();
        }
        if accounted != space.used() {
            return Err(format!(
                "records account for {} bytes, accountant has {} used",
                accounted,
                space.used()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::repository::checksum::ChecksumType;

    fn repository(total: u64) -> (ReplicaRepository, SimulatedClock) {
        let clock = SimulatedClock::new(1_000);
        let repo = ReplicaRepository::new(
            RepositoryConfig::test(total),
            Arc::new(MemoryReplicaStore::new()),
            Arc::new(clock.clone()),
        );
        (repo, clock)
    }

    fn committed(
        repo: &ReplicaRepository,
        n: u64,
        data: &[u8],
        options: CreateOptions,
    ) -> ReplicaId {
        let id = ReplicaId::from_u64(n);
        let mut handle = repo.create_entry(&id, options).unwrap();
        handle.allocate(data.len() as u64).unwrap();
        handle.append(data).unwrap();
        handle.commit(None).unwrap();
        handle.close().unwrap();
        id
    }

    #[test]
    fn test_create_enters_transfer_state() {
        let (repo, _) = repository(1000);
        let id = ReplicaId::from_u64(1);
        let _handle = repo.create_entry(&id, CreateOptions::from_store()).unwrap();
        assert_eq!(repo.state(&id).unwrap(), EntryState::FromStore);
        let err = repo.open_read(&id, OpenFlags::NONE).unwrap_err();
        assert!(matches!(err, RepositoryError::State(_)));
    }

    #[test]
    fn test_invalid_target_rejected() {
        let (repo, _) = repository(1000);
        let options = CreateOptions::from_client().with_target(EntryState::Removed);
        let err = repo.create_entry(&ReplicaId::from_u64(1), options).unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidArgument(_)));
        assert!(repo.ids().is_empty());
    }

    #[test]
    fn test_set_state_rules() {
        let (repo, _) = repository(1000);
        let id = committed(&repo, 1, b"abc", CreateOptions::from_client());
        assert_eq!(repo.state(&id).unwrap(), EntryState::Precious);

        repo.set_state(&id, EntryState::Cached).unwrap();
        assert_eq!(repo.get_space_record().removable, 3);
        // Same state again is a no-op
        repo.set_state(&id, EntryState::Cached).unwrap();

        let err = repo.set_state(&id, EntryState::FromClient).unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalTransition { from: EntryState::Cached, .. }));

        let missing = ReplicaId::from_u64(99);
        repo.set_state(&missing, EntryState::Removed).unwrap();
        let err = repo.set_state(&missing, EntryState::Cached).unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalTransition { from: EntryState::New, .. }));
    }

    #[test]
    fn test_remove_without_handles_destroys() {
        let (repo, _) = repository(1000);
        let id = committed(&repo, 1, b"abcdef", CreateOptions::from_store());
        assert_eq!(repo.get_space_record().free, 994);

        repo.set_state(&id, EntryState::Removed).unwrap();
        assert!(matches!(repo.state(&id), Err(RepositoryError::NotFound(_))));
        assert_eq!(repo.get_space_record().free, 1000);
        // Removing again is fine
        repo.set_state(&id, EntryState::Removed).unwrap();
        repo.check_invariants().unwrap();
    }

    #[test]
    fn test_remove_deferred_until_last_reader_closes() {
        let (repo, _) = repository(1000);
        let id = committed(&repo, 1, b"abcdef", CreateOptions::from_store());
        let mut reader = repo.open_read(&id, OpenFlags::NONE).unwrap();

        repo.set_state(&id, EntryState::Removed).unwrap();
        assert_eq!(repo.state(&id).unwrap(), EntryState::Removed);
        assert!(repo.open_read(&id, OpenFlags::NONE).is_err());
        assert_eq!(&reader.read_all().unwrap()[..], b"abcdef");

        reader.close().unwrap();
        assert!(repo.state(&id).is_err());
        assert_eq!(repo.get_space_record().free, 1000);
    }

    #[test]
    fn test_sticky_blocks_removable() {
        let (repo, clock) = repository(1000);
        let id = committed(&repo, 1, b"0123456789", CreateOptions::from_store());
        assert_eq!(repo.get_space_record().removable, 10);

        let until = Expiry::At(clock.now() + std::time::Duration::from_secs(5));
        assert!(repo.set_sticky(&id, "pinner", until, false).unwrap());
        assert_eq!(repo.get_space_record().removable, 0);
        assert!(repo.remove_expired_sticky().is_empty());

        clock.advance_ms(6_000);
        let expired = repo.remove_expired_sticky();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, id);
        assert_eq!(repo.get_space_record().removable, 10);
    }

    #[test]
    fn test_access_time_updates_lru() {
        let (repo, clock) = repository(1000);
        let a = committed(&repo, 1, b"a", CreateOptions::from_store());
        clock.advance_ms(1_000);
        let b = committed(&repo, 2, b"b", CreateOptions::from_store());
        assert_eq!(repo.get_space_record().lru, Some(Timestamp(1_000)));

        clock.advance_ms(1_000);
        repo.open_read(&a, OpenFlags::NONE).unwrap().close().unwrap();
        assert_eq!(repo.get_space_record().lru, Some(Timestamp(2_000)));

        clock.advance_ms(1_000);
        repo.open_read(&b, OpenFlags::NO_ATIME).unwrap().close().unwrap();
        assert_eq!(repo.entry(&b).unwrap().last_access, Timestamp(2_000));
    }

    #[test]
    fn test_verify_checksum_marks_broken() {
        let (repo, _) = repository(1000);
        let sum = ChecksumType::Crc32.digest(b"payload");
        let options = CreateOptions::from_store().with_checksum(sum.clone());
        let id = committed(&repo, 1, b"payload", options);
        assert_eq!(repo.verify_checksum(&id).unwrap(), vec![sum]);

        let record = repo.store().get(&id).unwrap();
        record
            .open_channel(ChannelOptions::write())
            .unwrap()
            .write_at(0, b"X")
            .unwrap();
        let err = repo.verify_checksum(&id).unwrap_err();
        assert!(matches!(err, RepositoryError::ChecksumMismatch { .. }));
        assert!(repo.entry(&id).unwrap().broken);
        assert_eq!(repo.get_space_record().removable, 0);
    }

    #[test]
    fn test_set_total_space() {
        let (repo, _) = repository(100);
        committed(&repo, 1, &[0u8; 60], CreateOptions::from_store());
        assert!(matches!(repo.set_total_space(50), Err(RepositoryError::Resource(_))));
        repo.set_total_space(200).unwrap();
        assert_eq!(repo.get_space_record().free, 140);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_operations() {
        let (repo, _) = repository(100);
        repo.shutdown().await;
        let err = repo
            .create_entry(&ReplicaId::from_u64(1), CreateOptions::from_client())
            .unwrap_err();
        assert!(matches!(err, RepositoryError::State(_)));
    }
}
