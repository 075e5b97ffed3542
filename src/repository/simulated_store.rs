//! Simulated Replica Store with Fault Injection
//!
//! DST-compatible wrapper that fails storage operations of an inner store
//! with seeded probabilities. Faults land where a real medium fails:
//!
//! - **open**: opening a replica's data channel returns an I/O error
//! - **delete**: the record leaves the index but deleting its bytes fails,
//!   which the repository reports as a leaked replica

use crate::clock::Timestamp;
use crate::repository::channel::{ChannelOptions, RepositoryChannel};
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::record::{RecordMeta, ReplicaRecord};
use crate::repository::store::ReplicaStore;
use parking_lot::{Mutex, MutexGuard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;

/// Configuration for simulated fault injection
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedStoreConfig {
    /// Probability of opening a data channel failing
    pub open_fail_prob: f64,
    /// Probability of deleting a replica's bytes failing
    pub delete_fail_prob: f64,
}

impl Default for SimulatedStoreConfig {
    fn default() -> Self {
        SimulatedStoreConfig {
            open_fail_prob: 0.02,
            delete_fail_prob: 0.02,
        }
    }
}

impl SimulatedStoreConfig {
    /// High chaos configuration for stress testing
    pub fn high_chaos() -> Self {
        SimulatedStoreConfig {
            open_fail_prob: 0.1,
            delete_fail_prob: 0.2,
        }
    }

    /// No faults - for baseline testing
    pub fn no_faults() -> Self {
        SimulatedStoreConfig {
            open_fail_prob: 0.0,
            delete_fail_prob: 0.0,
        }
    }
}

/// Statistics for fault injection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatedStoreStats {
    pub open_attempts: u64,
    pub open_failures: u64,
    pub delete_attempts: u64,
    pub delete_failures: u64,
}

struct SimulatedStoreInner {
    rng: ChaCha8Rng,
    stats: SimulatedStoreStats,
}

/// Shared fault source of one simulated store and all its records
#[derive(Clone)]
struct FaultSource {
    config: SimulatedStoreConfig,
    state: Arc<Mutex<SimulatedStoreInner>>,
}

impl FaultSource {
    fn open(&self) -> bool {
        let mut state = self.state.lock();
        state.stats.open_attempts += 1;
        let fail = state.rng.gen_bool(self.config.open_fail_prob);
        if fail {
            state.stats.open_failures += 1;
        }
        fail
    }

    fn delete(&self) -> bool {
        let mut state = self.state.lock();
        state.stats.delete_attempts += 1;
        let fail = state.rng.gen_bool(self.config.delete_fail_prob);
        if fail {
            state.stats.delete_failures += 1;
        }
        fail
    }
}

fn injected(what: &str, id: &ReplicaId) -> RepositoryError {
    RepositoryError::Io(IoError::new(
        ErrorKind::Other,
        format!("simulated {} failure for {}", what, id),
    ))
}

/// Record whose channel opens may fail
struct SimulatedRecord {
    inner: Arc<dyn ReplicaRecord>,
    faults: FaultSource,
}

impl ReplicaRecord for SimulatedRecord {
    fn id(&self) -> &ReplicaId {
        self.inner.id()
    }

    fn meta(&self) -> MutexGuard<'_, RecordMeta> {
        self.inner.meta()
    }

    fn open_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Box<dyn RepositoryChannel>, RepositoryError> {
        if self.faults.open() {
            return Err(injected("open", self.inner.id()));
        }
        self.inner.open_channel(options)
    }
}

/// Simulated replica store that wraps another store and injects faults
pub struct SimulatedReplicaStore<S: ReplicaStore> {
    inner: S,
    faults: FaultSource,
}

impl<S: ReplicaStore> SimulatedReplicaStore<S> {
    /// Create a simulated store whose faults follow `seed`
    pub fn new(inner: S, seed: u64, config: SimulatedStoreConfig) -> Self {
        SimulatedReplicaStore {
            inner,
            faults: FaultSource {
                config,
                state: Arc::new(Mutex::new(SimulatedStoreInner {
                    rng: ChaCha8Rng::seed_from_u64(seed),
                    stats: SimulatedStoreStats::default(),
                })),
            },
        }
    }

    pub fn config(&self) -> &SimulatedStoreConfig {
        &self.faults.config
    }

    /// Get fault injection statistics
    pub fn stats(&self) -> SimulatedStoreStats {
        self.faults.state.lock().stats.clone()
    }

    fn decorate(&self, record: Arc<dyn ReplicaRecord>) -> Arc<dyn ReplicaRecord> {
        Arc::new(SimulatedRecord {
            inner: record,
            faults: self.faults.clone(),
        })
    }
}

impl<S: ReplicaStore> ReplicaStore for SimulatedReplicaStore<S> {
    fn create(
        &self,
        id: &ReplicaId,
        now: Timestamp,
    ) -> Result<Arc<dyn ReplicaRecord>, RepositoryError> {
        let record = self.inner.create(id, now)?;
        Ok(self.decorate(record))
    }

    fn get(&self, id: &ReplicaId) -> Option<Arc<dyn ReplicaRecord>> {
        self.inner.get(id).map(|r| self.decorate(r))
    }

    fn remove(&self, id: &ReplicaId) -> Result<(), RepositoryError> {
        // The index entry is gone either way, as with a failed unlink
        self.inner.remove(id)?;
        if self.faults.delete() {
            return Err(injected("delete", id));
        }
        Ok(())
    }

    fn ids(&self) -> Vec<ReplicaId> {
        self.inner.ids()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory_store::MemoryReplicaStore;

    #[test]
    fn test_no_faults_passes_through() {
        let store = SimulatedReplicaStore::new(
            MemoryReplicaStore::new(),
            7,
            SimulatedStoreConfig::no_faults(),
        );
        let id = ReplicaId::from_u64(1);
        let record = store.create(&id, Timestamp::ZERO).unwrap();
        assert!(record.open_channel(ChannelOptions::write()).is_ok());
        store.remove(&id).unwrap();
        assert!(store.is_empty());

        let stats = store.stats();
        assert_eq!(stats.open_attempts, 1);
        assert_eq!(stats.open_failures, 0);
        assert_eq!(stats.delete_attempts, 1);
    }

    #[test]
    fn test_failed_delete_still_drops_record() {
        let config = SimulatedStoreConfig {
            open_fail_prob: 0.0,
            delete_fail_prob: 1.0,
        };
        let store = SimulatedReplicaStore::new(MemoryReplicaStore::new(), 7, config);
        let id = ReplicaId::from_u64(1);
        store.create(&id, Timestamp::ZERO).unwrap();

        assert!(matches!(store.remove(&id), Err(RepositoryError::Io(_))));
        assert!(store.get(&id).is_none());
        assert_eq!(store.stats().delete_failures, 1);
    }

    #[test]
    fn test_faults_are_deterministic_per_seed() {
        let run = |seed| {
            let store = SimulatedReplicaStore::new(
                MemoryReplicaStore::new(),
                seed,
                SimulatedStoreConfig::high_chaos(),
            );
            let record = store.create(&ReplicaId::from_u64(1), Timestamp::ZERO).unwrap();
            (0..50)
                .map(|_| record.open_channel(ChannelOptions::read()).is_err())
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
        assert!(run(42).iter().any(|failed| *failed));
    }
}
