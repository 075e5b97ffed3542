//! Local filesystem replica store
//!
//! One data file per replica, named by its identifier, under a base
//! directory. Creation uses create-new semantics: a leftover data file for
//! the same id is reported as a duplicate entry rather than overwritten.
//! Metadata is kept in memory only.

use crate::clock::Timestamp;
use crate::repository::channel::{ChannelOptions, FileChannel, OpenMode, RepositoryChannel};
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::record::{RecordMeta, ReplicaRecord};
use crate::repository::store::{RecordIndex, ReplicaStore};
use parking_lot::{Mutex, MutexGuard};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Record backed by a data file
pub struct FileRecord {
    id: ReplicaId,
    meta: Mutex<RecordMeta>,
    path: PathBuf,
}

impl FileRecord {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReplicaRecord for FileRecord {
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
        let file = OpenOptions::new()
            .read(true)
            .write(options.mode == OpenMode::Write)
            .open(&self.path)?;
        Ok(Box::new(FileChannel::new(file, options.mode)))
    }
}

/// Filesystem-backed replica store
pub struct FileReplicaStore {
    base_path: PathBuf,
    index: RecordIndex<FileRecord>,
}

impl FileReplicaStore {
    /// Open a store rooted at `base_path`, creating the directory if needed
    pub fn new(base_path: impl Into<PathBuf>) -> IoResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)?;
        Ok(FileReplicaStore {
            base_path,
            index: RecordIndex::new(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn data_path(&self, id: &ReplicaId) -> PathBuf {
        self.base_path.join(id.as_str())
    }
}

impl ReplicaStore for FileReplicaStore {
    fn create(
        &self,
        id: &ReplicaId,
        now: Timestamp,
    ) -> Result<Arc<dyn ReplicaRecord>, RepositoryError> {
        let path = self.data_path(id);
        let record = self.index.insert_with(
            id,
            || {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|e| match e.kind() {
                        ErrorKind::AlreadyExists => RepositoryError::DuplicateEntry(id.clone()),
                        _ => RepositoryError::Io(e),
                    })?;
                Ok(Arc::new(FileRecord {
                    id: id.clone(),
                    meta: Mutex::new(RecordMeta::new(now)),
                    path: path.clone(),
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
        let Some(record) = self.index.remove(id) else {
            return Ok(());
        };
        match fs::remove_file(&record.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Data file for {} already gone", id);
                Ok(())
            }
            Err(e) => Err(RepositoryError::Io(e)),
        }
    }

    fn ids(&self) -> Vec<ReplicaId> {
        self.index.ids()
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
