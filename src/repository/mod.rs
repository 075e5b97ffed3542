//! Replica Repository
//!
//! Owns the replicas stored on one pool: their lifecycle, space accounting,
//! pins, checksums and the events other subsystems react to.
//!
//! ## Architecture
//!
//! ```text
//!   create_entry / open_read / set_state / set_sticky
//!                        │
//!                ReplicaRepository ──► StateChangeNotifier ──► listeners
//!                  │            │
//!           SpaceAccountant   ReplicaStore (ChecksumReplicaStore)
//!                                    │
//!                      MemoryReplicaStore | FileReplicaStore
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//!   NEW ─► FROM_CLIENT | FROM_STORE ─commit─► CACHED ⇄ PRECIOUS
//!                  │                              │
//!            (abort: BROKEN                       ▼
//!             or REMOVED)                      REMOVED ─► DESTROYED
//! ```

pub mod account;
pub mod channel;
pub mod checksum;
pub mod dst;
pub mod error;
pub mod events;
pub mod expiration;
pub mod file_store;
pub mod handle;
pub mod id;
pub mod memory_store;
pub mod notifier;
pub mod record;
pub mod repository;
pub mod simulated_store;
pub mod state;
pub mod sticky;
pub mod store;

pub use account::{SpaceAccountant, SpaceRecord};
pub use channel::{ChannelOptions, OpenMode, RepositoryChannel};
pub use checksum::{Checksum, ChecksumReplicaStore, ChecksumType};
pub use dst::{
    run_repository_dst_batch, summarize_repository_dst_batch, RepositoryDSTConfig,
    RepositoryDSTHarness, RepositoryDSTResult,
};
pub use error::RepositoryError;
pub use events::{
    AccessTimeChangeEvent, FaultAction, FaultEvent, RepositoryEvent, StateChangeEvent,
    StateChangeListener, StickyChangeEvent,
};
pub use expiration::ExpirationWorker;
pub use file_store::FileReplicaStore;
pub use handle::{ReadHandle, WriteHandle};
pub use id::ReplicaId;
pub use memory_store::MemoryReplicaStore;
pub use notifier::{NotificationMode, StateChangeNotifier};
pub use record::{CacheEntry, RecordMeta, ReplicaRecord};
pub use repository::{CreateOptions, OpenFlags, ReplicaRepository};
pub use simulated_store::{SimulatedReplicaStore, SimulatedStoreConfig, SimulatedStoreStats};
pub use state::{EntryState, Provenance, RecordFlags};
pub use sticky::{Expiry, StickyRecord, StickyRegistry};
pub use store::ReplicaStore;
