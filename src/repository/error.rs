//! Repository error taxonomy
//!
//! Each variant maps to one class of failure with a fixed recovery policy:
//! only `NoSpace` is worth retrying (after eviction frees space); every
//! other variant is either a caller bug, an integrity failure, or a storage
//! fault that must surface to the caller.

use crate::repository::checksum::Checksum;
use crate::repository::id::ReplicaId;
use crate::repository::state::EntryState;
use std::io::Error as IoError;

/// Error type for repository, record and handle operations
#[derive(Debug)]
pub enum RepositoryError {
    /// Handle used after close/commit, or record in the wrong state
    State(String),
    /// No record with this id
    NotFound(ReplicaId),
    /// A record with this id already exists
    DuplicateEntry(ReplicaId),
    /// Not enough free space for the allocation
    NoSpace { requested: u64, free: u64 },
    /// Supplied or computed checksum disagrees with the known one
    ChecksumMismatch { expected: Checksum, actual: Checksum },
    /// Allocation contract violated (e.g. writing past the allocation)
    Resource(String),
    /// State change not permitted by the lifecycle
    IllegalTransition {
        id: ReplicaId,
        from: EntryState,
        to: EntryState,
    },
    /// Malformed argument
    InvalidArgument(String),
    /// Storage medium failure
    Io(IoError),
}

impl RepositoryError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, RepositoryError::NoSpace { .. })
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        RepositoryError::State(msg.into())
    }
}

impl std::fmt::Display for RepositoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepositoryError::State(msg) => write!(f, "Illegal state: {}", msg),
            RepositoryError::NotFound(id) => write!(f, "Replica not in repository: {}", id),
            RepositoryError::DuplicateEntry(id) => write!(f, "Replica already exists: {}", id),
            RepositoryError::NoSpace { requested, free } => write!(
                f,
                "Not enough space: requested {} bytes, {} free",
                requested, free
            ),
            RepositoryError::ChecksumMismatch { expected, actual } => {
                write!(f, "Checksum mismatch: expected {}, got {}", expected, actual)
            }
            RepositoryError::Resource(msg) => write!(f, "Resource error: {}", msg),
            RepositoryError::IllegalTransition { id, from, to } => write!(
                f,
                "Illegal state transition for {}: {} -> {}",
                id, from, to
            ),
            RepositoryError::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            RepositoryError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for RepositoryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RepositoryError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for RepositoryError {
    fn from(e: IoError) -> Self {
        RepositoryError::Io(e)
    }
}
