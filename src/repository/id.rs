//! Replica identifiers
//!
//! A replica is named by the content-addressable id of the data object it
//! holds: a fixed-format string of 24 or 36 hexadecimal digits. Ids are
//! normalised to upper case so that differently-cased spellings of the same
//! id address the same record.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Accepted id lengths (short legacy form and long form)
const ID_LENGTHS: [usize; 2] = [24, 36];

/// Identifier of a data object, and therefore of its replica
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReplicaId(String);

/// Error returned when parsing a malformed id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidReplicaId(pub String);

impl std::fmt::Display for InvalidReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid replica id '{}': expected 24 or 36 hex digits",
            self.0
        )
    }
}

impl std::error::Error for InvalidReplicaId {}

impl ReplicaId {
    /// Build a short-form id from a number. Handy for tests and simulation.
    pub fn from_u64(n: u64) -> Self {
        ReplicaId(format!("{:024X}", n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for ReplicaId {
    type Err = InvalidReplicaId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !ID_LENGTHS.contains(&s.len()) || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(InvalidReplicaId(s.to_string()));
        }
        Ok(ReplicaId(s.to_ascii_uppercase()))
    }
}

impl TryFrom<String> for ReplicaId {
    type Error = InvalidReplicaId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReplicaId> for String {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
