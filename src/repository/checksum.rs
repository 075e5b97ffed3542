//! Checksums and the checksum-computing store decorator
//!
//! `ChecksumReplicaStore` wraps any [`ReplicaStore`]; records it hands out
//! are wrapped in `ChecksumReplicaRecord`, whose channels digest bytes as
//! they are written when opened with `calculate_checksums`.
//!
//! ```text
//! WriteHandle ──► ChecksumChannel ──► inner channel ──► bytes
//!                     │
//!                     └─ crc32 / sha1 / sha256 digesters
//! ```
//!
//! Decorators compose: a channel only digests the types that the channel
//! it wraps does not already compute, so wrapping a store twice never feeds
//! the same bytes to two digesters of the same type.

use crate::clock::Timestamp;
use crate::repository::channel::{ChannelOptions, RepositoryChannel};
use crate::repository::error::RepositoryError;
use crate::repository::id::ReplicaId;
use crate::repository::record::{RecordMeta, ReplicaRecord};
use crate::repository::store::ReplicaStore;
use parking_lot::MutexGuard;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::io::Result as IoResult;
use std::str::FromStr;
use std::sync::Arc;

const DIGEST_CHUNK: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Crc32,
    Sha1,
    Sha256,
}

impl ChecksumType {
    pub fn name(&self) -> &'static str {
        match self {
            ChecksumType::Crc32 => "crc32",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha256 => "sha256",
        }
    }

    /// Digest a complete buffer
    pub fn digest(&self, data: &[u8]) -> Checksum {
        let mut d = Digester::new(*self);
        d.update(data);
        d.finish()
    }
}

impl std::fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumType {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crc32" => Ok(ChecksumType::Crc32),
            "sha1" => Ok(ChecksumType::Sha1),
            "sha256" | "sha-256" => Ok(ChecksumType::Sha256),
            _ => Err(RepositoryError::InvalidArgument(format!(
                "unknown checksum type: {}",
                s
            ))),
        }
    }
}

/// A digest value of one type, hex-encoded in lowercase
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub kind: ChecksumType,
    pub value: String,
}

impl Checksum {
    pub fn new(kind: ChecksumType, value: impl Into<String>) -> Self {
        Checksum {
            kind,
            value: value.into().to_ascii_lowercase(),
        }
    }
}

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

impl FromStr for Checksum {
    type Err = RepositoryError;

    /// Parses `"<type>:<hex>"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| RepositoryError::InvalidArgument(format!("malformed checksum: {}", s)))?;
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(RepositoryError::InvalidArgument(format!(
                "malformed checksum value: {}",
                s
            )));
        }
        Ok(Checksum::new(kind.parse()?, value))
    }
}

// ============================================================================
// Digester
// ============================================================================

/// Incremental digest state for one checksum type
#[derive(Clone)]
enum Digester {
    Crc32(crc32fast::Hasher),
    Sha1(sha1::Sha1),
    Sha256(sha2::Sha256),
}

impl Digester {
    fn new(kind: ChecksumType) -> Self {
        match kind {
            ChecksumType::Crc32 => Digester::Crc32(crc32fast::Hasher::new()),
            ChecksumType::Sha1 => Digester::Sha1(<sha1::Sha1 as sha1::Digest>::new()),
            ChecksumType::Sha256 => Digester::Sha256(<sha2::Sha256 as sha2::Digest>::new()),
        }
    }

    fn kind(&self) -> ChecksumType {
        match self {
            Digester::Crc32(_) => ChecksumType::Crc32,
            Digester::Sha1(_) => ChecksumType::Sha1,
            Digester::Sha256(_) => ChecksumType::Sha256,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Digester::Crc32(h) => h.update(data),
            Digester::Sha1(h) => sha1::Digest::update(h, data),
            Digester::Sha256(h) => sha2::Digest::update(h, data),
        }
    }

    /// Value of everything fed so far; the digester keeps accepting bytes
    fn finish(&self) -> Checksum {
        let value = match self {
            Digester::Crc32(h) => format!("{:08x}", h.clone().finalize()),
            Digester::Sha1(h) => hex(&sha1::Digest::finalize(h.clone())),
            Digester::Sha256(h) => hex(&sha2::Digest::finalize(h.clone())),
        };
        Checksum::new(self.kind(), value)
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Read a channel from the start and digest it with each of `kinds`
pub fn digest_channel(
    channel: &mut dyn RepositoryChannel,
    kinds: &[ChecksumType],
) -> IoResult<Vec<Checksum>> {
    let mut digesters: Vec<Digester> = kinds.iter().map(|k| Digester::new(*k)).collect();
    let mut buf = vec![0u8; DIGEST_CHUNK];
    let mut offset = 0u64;
    loop {
        let n = channel.read_at(offset, &mut buf)?;
        if n == 0 {
            break;
        }
        for d in digesters.iter_mut() {
            d.update(&buf[..n]);
        }
        offset += n as u64;
    }
    Ok(digesters.iter().map(Digester::finish).collect())
}

// ============================================================================
// ChecksumChannel
// ============================================================================

/// Channel decorator that digests bytes on their way to the inner channel
///
/// Digests are computed incrementally while writes arrive in order. After
/// an out-of-order write the channel falls back to re-reading the inner
/// channel when the checksums are requested.
pub struct ChecksumChannel {
    inner: Box<dyn RepositoryChannel>,
    digesters: Vec<Digester>,
    next_offset: u64,
    sequential: bool,
}

impl ChecksumChannel {
    /// Wrap `inner` so that it computes `types`.
    ///
    /// Types the inner channel already computes are skipped; if nothing is
    /// left to compute, `inner` is returned as is.
    pub fn wrap(
        inner: Box<dyn RepositoryChannel>,
        types: &[ChecksumType],
    ) -> Box<dyn RepositoryChannel> {
        let existing = inner.checksum_types();
        let mut kinds: Vec<ChecksumType> = types
            .iter()
            .copied()
            .filter(|t| !existing.contains(t))
            .collect();
        kinds.sort();
        kinds.dedup();
        if kinds.is_empty() {
            return inner;
        }
        Box::new(ChecksumChannel {
            inner,
            digesters: kinds.into_iter().map(Digester::new).collect(),
            next_offset: 0,
            sequential: true,
        })
    }

    fn own_types(&self) -> Vec<ChecksumType> {
        self.digesters.iter().map(Digester::kind).collect()
    }
}

impl RepositoryChannel for ChecksumChannel {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> IoResult<()> {
        self.inner.write_at(offset, data)?;
        if self.sequential && offset == self.next_offset {
            for d in self.digesters.iter_mut() {
                d.update(data);
            }
            self.next_offset += data.len() as u64;
        } else {
            self.sequential = false;
        }
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        self.inner.read_at(offset, buf)
    }

    fn size(&mut self) -> IoResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> IoResult<()> {
        self.inner.sync()
    }

    fn checksum_types(&self) -> Vec<ChecksumType> {
        let mut types = self.inner.checksum_types();
        types.extend(self.own_types());
        types
    }

    fn checksums(&mut self) -> IoResult<Vec<Checksum>> {
        let mut out = self.inner.checksums()?;
        let size = self.inner.size()?;
        if self.sequential && self.next_offset == size {
            out.extend(self.digesters.iter().map(Digester::finish));
        } else {
            let kinds = self.own_types();
            out.extend(digest_channel(self.inner.as_mut(), &kinds)?);
        }
        Ok(out)
    }
}

// ============================================================================
// ChecksumReplicaRecord / ChecksumReplicaStore
// ============================================================================

/// Record decorator whose write channels can compute checksums
pub struct ChecksumReplicaRecord {
    inner: Arc<dyn ReplicaRecord>,
    types: Arc<[ChecksumType]>,
}

impl ReplicaRecord for ChecksumReplicaRecord {
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
        let channel = self.inner.open_channel(options)?;
        if options.calculate_checksums {
            Ok(ChecksumChannel::wrap(channel, &self.types))
        } else {
            Ok(channel)
        }
    }
}

/// Store decorator handing out [`ChecksumReplicaRecord`]s
pub struct ChecksumReplicaStore<S: ReplicaStore> {
    inner: S,
    types: Arc<[ChecksumType]>,
}

impl<S: ReplicaStore> ChecksumReplicaStore<S> {
    pub fn new(inner: S, types: Vec<ChecksumType>) -> Self {
        ChecksumReplicaStore {
            inner,
            types: types.into(),
        }
    }

    pub fn types(&self) -> &[ChecksumType] {
        &self.types
    }

    fn decorate(&self, record: Arc<dyn ReplicaRecord>) -> Arc<dyn ReplicaRecord> {
        Arc::new(ChecksumReplicaRecord {
            inner: record,
            types: self.types.clone(),
        })
    }
}

impl<S: ReplicaStore> ReplicaStore for ChecksumReplicaStore<S> {
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
        self.inner.remove(id)
    }

    fn ids(&self) -> Vec<ReplicaId> {
        self.inner.ids()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}
