//! Read and write handles
//!
//! A handle is the capability to access the bytes of one replica. It is
//! bound to exactly one record and must be closed exactly once; closing
//! twice, or using a handle after close, is a state error. Dropping an open
//! handle closes it.
//!
//! ```text
//! create_entry ──► WriteHandle ── allocate/write ──► commit ──► close
//!                                    │
//!                                    └── close (no commit) ──► BROKEN or deleted
//!
//! open_read ──► ReadHandle ── read ──► close ──► (destroy if REMOVED and last)
//! ```

use crate::config::AbortPolicy;
use crate::repository::channel::RepositoryChannel;
use crate::repository::checksum::Checksum;
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::record::{CacheEntry, ReplicaRecord};
use crate::repository::repository::RepositoryCore;
use crate::repository::state::EntryState;
use crate::repository::sticky::StickyRecord;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, warn};

fn already_closed() -> RepositoryError {
    RepositoryError::state("handle already closed")
}

// ============================================================================
// ReadHandle
// ============================================================================

/// Shared read access to a committed replica
pub struct ReadHandle {
    core: Arc<RepositoryCore>,
    record: Arc<dyn ReplicaRecord>,
    /// `None` once closed
    channel: Option<Box<dyn RepositoryChannel>>,
}

impl ReadHandle {
    pub(crate) fn new(
        core: Arc<RepositoryCore>,
        record: Arc<dyn ReplicaRecord>,
        channel: Box<dyn RepositoryChannel>,
    ) -> Self {
        ReadHandle {
            core,
            record,
            channel: Some(channel),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        self.record.id()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_none()
    }

    pub(crate) fn record(&self) -> &Arc<dyn ReplicaRecord> {
        &self.record
    }

    pub(crate) fn channel_mut(&mut self) -> Result<&mut dyn RepositoryChannel, RepositoryError> {
        match self.channel.as_mut() {
            Some(channel) => Ok(channel.as_mut()),
            None => Err(already_closed()),
        }
    }

    /// Snapshot of the record
    pub fn entry(&self) -> Result<CacheEntry, RepositoryError> {
        if self.is_closed() {
            return Err(already_closed());
        }
        let meta = self.record.meta();
        Ok(meta.snapshot(self.record.id(), self.core.now()))
    }

    pub fn size(&mut self) -> Result<u64, RepositoryError> {
        Ok(self.channel_mut()?.size()?)
    }

    /// Read into `buf` from `offset`; returns bytes read, 0 at end of data
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, RepositoryError> {
        Ok(self.channel_mut()?.read_at(offset, buf)?)
    }

    /// Read the whole replica
    pub fn read_all(&mut self) -> Result<Bytes, RepositoryError> {
        let channel = self.channel_mut()?;
        let size = usize::try_from(channel.size()?)
            .map_err(|_| RepositoryError::Resource("replica too large to buffer".to_string()))?;
        let mut data = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = channel.read_at(filled as u64, &mut data[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        Ok(Bytes::from(data))
    }

    /// Release the handle. A removed record is destroyed when its last
    /// handle closes.
    pub fn close(&mut self) -> Result<(), RepositoryError> {
        if self.is_closed() {
            return Err(already_closed());
        }
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        self.channel = None;
        let record = self.record.clone();
        let mut meta = record.meta();
        meta.remove_reader();
        if meta.state() == EntryState::Removed && meta.is_idle() {
            self.core.destroy(record.as_ref(), &mut meta);
        }
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.release();
        }
    }
}

impl std::fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHandle")
            .field("id", self.record.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// WriteHandle
// ============================================================================

/// Exclusive write access to a replica being created
pub struct WriteHandle {
    core: Arc<RepositoryCore>,
    record: Arc<dyn ReplicaRecord>,
    channel: Option<Box<dyn RepositoryChannel>>,
    target: EntryState,
    sticky: Vec<StickyRecord>,
    /// Bytes reserved with the accountant for this replica
    allocated: u64,
    /// End of the furthest write
    position: u64,
    committed: bool,
    closed: bool,
}

impl WriteHandle {
    pub(crate) fn new(
        core: Arc<RepositoryCore>,
        record: Arc<dyn ReplicaRecord>,
        channel: Box<dyn RepositoryChannel>,
        target: EntryState,
        sticky: Vec<StickyRecord>,
    ) -> Self {
        WriteHandle {
            core,
            record,
            channel: Some(channel),
            target,
            sticky,
            allocated: 0,
            position: 0,
            committed: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &ReplicaId {
        self.record.id()
    }

    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn entry(&self) -> Result<CacheEntry, RepositoryError> {
        if self.closed {
            return Err(already_closed());
        }
        let meta = self.record.meta();
        Ok(meta.snapshot(self.record.id(), self.core.now()))
    }

    fn ensure_writable(&self) -> Result<(), RepositoryError> {
        if self.closed {
            return Err(already_closed());
        }
        if self.committed {
            return Err(RepositoryError::state("handle already committed"));
        }
        Ok(())
    }

    /// Space and visibility changes need a live repository; plain writes
    /// into the existing allocation do not
    fn ensure_live(&self) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        self.core.ensure_open()
    }

    fn grow(&mut self, n: u64) {
        self.allocated += n;
        self.record.meta().set_size(self.allocated);
    }

    /// Reserve `n` more bytes; fails fast with `NoSpace`
    pub fn allocate(&mut self, n: u64) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        self.core.account().allocate(n)?;
        self.grow(n);
        Ok(())
    }

    /// Reserve `n` more bytes, waiting for space to be freed
    pub async fn allocate_wait(&mut self, n: u64) -> Result<(), RepositoryError> {
        self.ensure_live()?;
        self.core.account().allocate_wait(n).await?;
        self.grow(n);
        Ok(())
    }

    /// Write `data` at `offset`; the range must lie within the allocation
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), RepositoryError> {
        self.ensure_writable()?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| RepositoryError::InvalidArgument("write range overflows".to_string()))?;
        if end > self.allocated {
            return Err(RepositoryError::Resource(format!(
                "write of {} bytes at {} exceeds allocation of {} bytes",
                data.len(),
                offset,
                self.allocated
            )));
        }
        let channel = self.channel.as_mut().ok_or_else(already_closed)?;
        channel.write_at(offset, data)?;
        self.position = self.position.max(end);
        Ok(())
    }

    /// Write `data` after the furthest byte written so far
    pub fn append(&mut self, data: &[u8]) -> Result<(), RepositoryError> {
        self.write_at(self.position, data)
    }

    /// Make the replica durable and visible.
    ///
    /// Reconciles the reservation with the data length, checks `expected`
    /// and any computed checksums against the checksum already known for the
    /// replica, and moves it to its target state. On checksum mismatch the
    /// handle stays open and uncommitted.
    pub fn commit(&mut self, expected: Option<Checksum>) -> Result<CacheEntry, RepositoryError> {
        self.ensure_live()?;
        let channel = self.channel.as_mut().ok_or_else(already_closed)?;
        let length = channel.size()?;
        channel.sync()?;
        let computed = channel.checksums()?;
        if length > self.allocated {
            return Err(RepositoryError::Resource(format!(
                "replica holds {} bytes, only {} allocated",
                length, self.allocated
            )));
        }

        let record = self.record.clone();
        let id = record.id();
        let mut meta = record.meta();
        if !meta.state().is_incomplete() {
            return Err(RepositoryError::state(format!(
                "replica {} is {}",
                id,
                meta.state()
            )));
        }

        for candidate in expected.iter().chain(computed.iter()) {
            if let Some(known) = meta.checksum(candidate.kind) {
                if known != candidate {
                    return Err(RepositoryError::ChecksumMismatch {
                        expected: known.clone(),
                        actual: candidate.clone(),
                    });
                }
            }
        }
        if let Some(supplied) = &expected {
            if let Some(actual) = computed.iter().find(|c| c.kind == supplied.kind) {
                if actual != supplied {
                    return Err(RepositoryError::ChecksumMismatch {
                        expected: supplied.clone(),
                        actual: actual.clone(),
                    });
                }
            }
        }

        let now = self.core.now();
        let old = meta.snapshot(id, now);

        self.core.account().free(self.allocated - length);
        self.allocated = length;
        meta.set_size(length);
        for checksum in expected.into_iter().chain(computed) {
            meta.add_checksum(checksum);
        }
        let sticky = &self.sticky;
        meta.update_sticky(|registry| {
            for pin in sticky {
                registry.add_record(&pin.owner, pin.expire, true, now);
            }
        });
        meta.set_state(id, self.target)?;

        let new = meta.snapshot(id, now);
        self.core.publish_state(old, new.clone());
        self.committed = true;
        debug!("Committed {} ({} bytes) as {}", id, length, self.target);
        Ok(new)
    }

    /// Release the handle. Without a prior commit the replica is marked
    /// broken or deleted, depending on the configured abort policy.
    pub fn close(&mut self) -> Result<(), RepositoryError> {
        if self.closed {
            return Err(already_closed());
        }
        self.closed = true;
        let length = self.channel.as_mut().and_then(|c| c.size().ok());
        self.channel = None;

        let record = self.record.clone();
        let mut meta = record.meta();
        meta.set_writer(false);

        if self.committed || meta.state() == EntryState::Removed {
            if meta.state() == EntryState::Removed && meta.is_idle() {
                self.core.destroy(record.as_ref(), &mut meta);
            }
            return Ok(());
        }

        match self.core.abort_policy() {
            AbortPolicy::MarkBroken => {
                let length = length.unwrap_or(self.allocated).min(self.allocated);
                self.core.account().free(self.allocated - length);
                self.allocated = length;
                self.core.update(record.as_ref(), &mut meta, |m| {
                    m.set_size(length);
                    m.set_broken(true);
                });
                warn!("Write of {} closed without commit, marked broken", record.id());
            }
            AbortPolicy::Delete => {
                self.core
                    .transition(record.as_ref(), &mut meta, EntryState::Removed)?;
                if meta.is_idle() {
                    self.core.destroy(record.as_ref(), &mut meta);
                }
                warn!("Write of {} closed without commit, deleted", record.id());
            }
        }
        Ok(())
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.closed {
            warn!("Write handle for {} dropped without close", self.record.id());
            if let Err(e) = self.close() {
                error!("Failed to close write handle for {}: {}", self.record.id(), e);
            }
        }
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("id", self.record.id())
            .field("allocated", &self.allocated)
            .field("committed", &self.committed)
            .field("closed", &self.closed)
            .finish()
    }
}
