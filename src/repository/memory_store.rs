//! In-memory replica store for unit tests and deterministic simulation

use crate::clock::Timestamp;
use crate::repository::channel::{ChannelOptions, MemoryChannel, RepositoryChannel};
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::record::{RecordMeta, ReplicaRecord};
use crate::repository::store::{RecordIndex, ReplicaStore};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;

/// Record whose bytes live in a shared buffer
pub struct MemoryRecord {
    id: ReplicaId,
    meta: Mutex<RecordMeta>,
    data: Arc<RwLock<Vec<u8>>>,
}

impl ReplicaRecord for MemoryRecord {
    fn id(&self) -> &ReplicaId {
        &self.id
    }

    fn meta(&self) -> MutexGuard<'_, RecordMeta> {
        self.meta.lock()
    }

    fn open_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Box<dyn RepositoryChannel>, RepositoryError> {
        Ok(Box::new(MemoryChannel::new(self.data.clone(), options.mode)))
    }
}

/// In-memory replica store
#[derive(Default)]
pub struct MemoryReplicaStore {
    index: RecordIndex<MemoryRecord>,
}

impl MemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplicaStore for MemoryReplicaStore {
    fn create(
        &self,
        id: &ReplicaId,
        now: Timestamp,
    ) -> Result<Arc<dyn ReplicaRecord>, RepositoryError> {
        let record = self.index.insert_with(
            id,
            || {
                Ok(Arc::new(MemoryRecord {
                    id: id.clone(),
                    meta: Mutex::new(RecordMeta::new(now)),
                    data: Arc::new(RwLock::new(Vec::new())),
                }))
            },
            || RepositoryError::DuplicateEntry(id.clone()),
        )?;
        Ok(record)
    }

    fn get(&self, id: &ReplicaId) -> Option<Arc<dyn ReplicaRecord>> {
        self.index
            .get(id)
            .map(|r| r as Arc<dyn ReplicaRecord>)
    }

    fn remove(&self, id: &ReplicaId) -> Result<(), RepositoryError> {
        if let Some(record) = self.index.remove(id) {
            let mut data = record.data.write();
            data.clear();
            data.shrink_to_fit();
        }
        Ok(())
    }

    fn ids(&self) -> Vec<ReplicaId> {
        self.index.ids()
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
