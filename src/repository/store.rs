//! Replica store abstraction
//!
//! A store maps identifiers to records and owns the bytes behind them.
//! Stores are synchronous: every operation is a short critical section on
//! one shard of the index plus whatever the storage medium needs.
//!
//! Implementations:
//! - `MemoryReplicaStore`: for unit tests and DST
//! - `FileReplicaStore`: one data file per replica under a base directory
//! - `ChecksumReplicaStore`: decorator computing checksums on write
//! - `SimulatedReplicaStore`: decorator injecting storage faults for DST

use crate::clock::Timestamp;
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::record::ReplicaRecord;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::hash::BuildHasher;
use std::sync::Arc;

/// Number of index shards; operations on ids in different shards never
/// touch the same lock
const NUM_SHARDS: usize = 16;

/// Keyed storage of replica records
pub trait ReplicaStore: Send + Sync + 'static {
    /// Create an empty record in state `NEW`.
    ///
    /// Fails with `DuplicateEntry` if a record with this id exists, in any
    /// state including mid-write.
    fn create(
        &self,
        id: &ReplicaId,
        now: Timestamp,
    ) -> Result<Arc<dyn ReplicaRecord>, RepositoryError>;

    /// Look up a record
    fn get(&self, id: &ReplicaId) -> Option<Arc<dyn ReplicaRecord>>;

    /// Drop the record from the index and delete its bytes.
    ///
    /// The caller guarantees the record is `DESTROYED`. Removing an unknown
    /// id is a no-op.
    fn remove(&self, id: &ReplicaId) -> Result<(), RepositoryError>;

    /// Identifiers of all records
    fn ids(&self) -> Vec<ReplicaId>;

    /// Number of records
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<S: ReplicaStore + ?Sized> ReplicaStore for Arc<S> {
    fn create(
        &self,
        id: &ReplicaId,
        now: Timestamp,
    ) -> Result<Arc<dyn ReplicaRecord>, RepositoryError> {
        (**self).create(id, now)
    }

    fn get(&self, id: &ReplicaId) -> Option<Arc<dyn ReplicaRecord>> {
        (**self).get(id)
    }

    fn remove(&self, id: &ReplicaId) -> Result<(), RepositoryError> {
        (**self).remove(id)
    }

    fn ids(&self) -> Vec<ReplicaId> {
        (**self).ids()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

// ============================================================================
// RecordIndex
// ============================================================================

/// Sharded id -> record map shared by the concrete stores
pub struct RecordIndex<R: ?Sized> {
    shards: Vec<RwLock<AHashMap<ReplicaId, Arc<R>>>>,
    hasher: ahash::RandomState,
}

impl<R: ?Sized> RecordIndex<R> {
    pub fn new() -> Self {
        RecordIndex {
            shards: (0..NUM_SHARDS)
                .map(|_| RwLock::new(AHashMap::new()))
                .collect(),
            hasher: ahash::RandomState::with_seeds(0x5eed, 0x1dea, 0xca5e, 0xf00d),
        }
    }

    fn shard(&self, id: &ReplicaId) -> &RwLock<AHashMap<ReplicaId, Arc<R>>> {
        let idx = (self.hasher.hash_one(id) as usize) % NUM_SHARDS;
        debug_assert!(idx < NUM_SHARDS, "Hash produced invalid shard index");
        &self.shards[idx]
    }

    /// Insert the record built by `make` unless the id is taken.
    /// `make` runs under the shard lock.
    pub fn insert_with<E>(
        &self,
        id: &ReplicaId,
        make: impl FnOnce() -> Result<Arc<R>, E>,
        duplicate: impl FnOnce() -> E,
    ) -> Result<Arc<R>, E> {
        let mut shard = self.shard(id).write();
        if shard.contains_key(id) {
            return Err(duplicate());
        }
        let record = make()?;
        shard.insert(id.clone(), record.clone());
        Ok(record)
    }

    pub fn get(&self, id: &ReplicaId) -> Option<Arc<R>> {
        self.shard(id).read().get(id).cloned()
    }

    pub fn remove(&self, id: &ReplicaId) -> Option<Arc<R>> {
        self.shard(id).write().remove(id)
    }

    pub fn ids(&self) -> Vec<ReplicaId> {
        let mut ids: Vec<ReplicaId> = self
            .shards
            .iter()
            .flat_map(|s| s.read().keys().cloned().collect::<Vec<_>>())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: ?Sized> Default for RecordIndex<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_rejects_duplicates() {
        let index: RecordIndex<u32> = RecordIndex::new();
        let id = ReplicaId::from_u64(1);
        index
            .insert_with(&id, || Ok::<_, ()>(Arc::new(1)), || ())
            .unwrap();
        let dup = index.insert_with(&id, || Ok(Arc::new(2)), || "dup");
        assert_eq!(dup.unwrap_err(), "dup");
        assert_eq!(*index.get(&id).unwrap(), 1);
    }

    #[test]
    fn test_index_ids_sorted_across_shards() {
        let index: RecordIndex<u64> = RecordIndex::new();
        for n in (0..50u64).rev() {
            let id = ReplicaId::from_u64(n);
            index.insert_with(&id, || Ok::<_, ()>(Arc::new(n)), || ()).unwrap();
        }
        let ids = index.ids();
        assert_eq!(ids.len(), 50);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(index.len(), 50);

        assert!(index.remove(&ReplicaId::from_u64(7)).is_some());
        assert!(index.remove(&ReplicaId::from_u64(7)).is_none());
        assert_eq!(index.len(), 49);
    }
}
