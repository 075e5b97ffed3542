pub mod clock;
pub mod config;
pub mod nearline;
pub mod observability;
pub mod repository;

#[cfg(test)]
mod stateright;

pub use clock::{Clock, ProductionClock, SimulatedClock, Timestamp};
pub use config::{PoolConfig, RepositoryConfig};
pub use nearline::{RemovalCoordinator, RemovalResult, RemovalTarget};
pub use repository::{
    CreateOptions, EntryState, ReplicaId, ReplicaRepository, RepositoryError, SpaceRecord,
};
