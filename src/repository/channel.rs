//! Byte channels onto replica data
//!
//! A [`RepositoryChannel`] is positional read/write access to the bytes of
//! one replica. Channels are owned by exactly one handle; sharing happens at
//! the data level (the in-memory buffer or the file), never at the channel.
//!
//! Implementations:
//! - `MemoryChannel`: over a shared in-memory buffer
//! - `FileChannel`: over a local file
//! - `ChecksumChannel` (in `checksum.rs`): digesting decorator

use crate::repository::checksum::{Checksum, ChecksumType};
use parking_lot::RwLock;
use std::fs::File;
use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Seek, SeekFrom, Write};
use std::sync::Arc;

/// Access mode for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Options for opening a record's byte channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub mode: OpenMode,
    /// Ask checksum-aware records to digest bytes as they are written
    pub calculate_checksums: bool,
}

impl ChannelOptions {
    pub fn read() -> Self {
        ChannelOptions {
            mode: OpenMode::Read,
            calculate_checksums: false,
        }
    }

    pub fn write() -> Self {
        ChannelOptions {
            mode: OpenMode::Write,
            calculate_checksums: false,
        }
    }

    pub fn with_checksums(mut self, enabled: bool) -> Self {
        self.calculate_checksums = enabled;
        self
    }
}

/// Positional access to the bytes of one replica
pub trait RepositoryChannel: Send {
    /// Write `data` at `offset`, growing the replica as needed
    fn write_at(&mut self, offset: u64, data: &[u8]) -> IoResult<()>;

    /// Read into `buf` from `offset`. Returns bytes read, 0 at end of data.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize>;

    /// Current length of the replica data
    fn size(&mut self) -> IoResult<u64>;

    /// Flush written bytes to durable storage
    fn sync(&mut self) -> IoResult<()>;

    /// Digest types this channel (or any channel it wraps) computes
    fn checksum_types(&self) -> Vec<ChecksumType> {
        Vec::new()
    }

    /// Digests of everything written so far, one per computed type
    fn checksums(&mut self) -> IoResult<Vec<Checksum>> {
        Ok(Vec::new())
    }
}

fn read_only() -> IoError {
    IoError::new(ErrorKind::PermissionDenied, "channel opened read-only")
}

// ============================================================================
// MemoryChannel
// ============================================================================

/// Channel over a shared in-memory buffer
pub struct MemoryChannel {
    data: Arc<RwLock<Vec<u8>>>,
    mode: OpenMode,
}

impl MemoryChannel {
    pub fn new(data: Arc<RwLock<Vec<u8>>>, mode: OpenMode) -> Self {
        MemoryChannel { data, mode }
    }
}

impl RepositoryChannel for MemoryChannel {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> IoResult<()> {
        if self.mode != OpenMode::Write {
            return Err(read_only());
        }
        let start = usize::try_from(offset)
            .map_err(|_| IoError::new(ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| IoError::new(ErrorKind::InvalidInput, "write overflows"))?;
        let mut buf = self.data.write();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        let data = self.data.read();
        let start = match usize::try_from(offset) {
            Ok(s) if s < data.len() => s,
            _ => return Ok(0),
        };
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn size(&mut self) -> IoResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn sync(&mut self) -> IoResult<()> {
        Ok(())
    }
}

// ============================================================================
// FileChannel
// ============================================================================

/// Channel over a local data file
pub struct FileChannel {
    file: File,
    mode: OpenMode,
}

impl FileChannel {
    pub fn new(file: File, mode: OpenMode) -> Self {
        FileChannel { file, mode }
    }
}

impl RepositoryChannel for FileChannel {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> IoResult<()> {
        if self.mode != OpenMode::Write {
            return Err(read_only());
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read(buf)
    }

    fn size(&mut self) -> IoResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> IoResult<()> {
        if self.mode == OpenMode::Write {
            self.file.sync_all()?;
        }
        Ok(())
    }
}
