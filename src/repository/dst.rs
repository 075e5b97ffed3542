//! Repository Deterministic Simulation Testing Harness
//!
//! Drives a repository with a seeded random mix of operations and checks,
//! after every step:
//!
//! - **Accounting**: the accountant's counters agree with the records, and
//!   precious/removable space equals what the record snapshots imply
//! - **Event continuity**: each state event for a replica starts in the state
//!   the previous one ended in, so no transition is lost or duplicated
//! - **Durability**: a readable replica returns exactly the bytes committed
//! - **Exclusivity**: creating an existing replica is a duplicate-entry error
//! - **Fault absorption**: an injected storage fault never leaves a dangling
//!   record or unaccounted bytes behind
//!
//! ## DST Methodology
//!
//! 1. Build a repository over a fault-injecting in-memory store with a
//!    `SimulatedClock`
//! 2. Apply random creates, aborted writes, reads, state changes, pins,
//!    clock advances, sweeps and checksum scans
//! 3. Keep a shadow copy of every committed replica's bytes
//! 4. Verify the invariants above after each operation

use crate::clock::{Clock, SimulatedClock};
use crate::config::{AbortPolicy, ChecksumPolicy, RepositoryConfig};
use crate::repository::checksum::{ChecksumReplicaStore, ChecksumType};
use crate::repository::error::RepositoryError;
use crate::repository::events::{FaultAction, FaultEvent, StateChangeEvent, StateChangeListener};
use crate::repository::handle::ReadHandle;
use crate::repository::id::ReplicaId;
use crate::repository::memory_store::MemoryReplicaStore;
use crate::repository::repository::{CreateOptions, OpenFlags, ReplicaRepository};
use crate::repository::simulated_store::{SimulatedReplicaStore, SimulatedStoreConfig};
use crate::repository::state::EntryState;
use crate::repository::sticky::Expiry;
use crate::repository::store::ReplicaStore;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result of a single DST run
#[derive(Debug, Clone)]
pub struct RepositoryDSTResult {
    pub seed: u64,
    pub operations: usize,
    pub commits: usize,
    pub aborted_writes: usize,
    pub reads: usize,
    pub removals: usize,
    pub no_space: usize,
    pub checksum_faults: usize,
    /// Injected storage faults surfaced to the harness as I/O errors
    pub storage_faults: usize,
    /// Replicas whose bytes could not be deleted after destroy
    pub leaked: usize,
    pub passed: bool,
    pub error_message: Option<String>,
}

/// Configuration for the repository DST harness
#[derive(Debug, Clone)]
pub struct RepositoryDSTConfig {
    /// Operations per run
    pub num_operations: usize,
    /// Size of the identifier space (small to force collisions)
    pub num_ids: u64,
    /// Pool size in bytes
    pub total_space: u64,
    /// Largest replica written
    pub max_replica_size: usize,
    /// Probability a write is abandoned before commit
    pub abort_probability: f64,
    /// Probability a commit carries a wrong expected checksum
    pub bad_checksum_probability: f64,
    /// Read handles kept open at most
    pub max_open_readers: usize,
    pub abort_policy: AbortPolicy,
    /// Storage faults injected below the repository
    pub store_faults: SimulatedStoreConfig,
}

impl Default for RepositoryDSTConfig {
    fn default() -> Self {
        RepositoryDSTConfig {
            num_operations: 300,
            num_ids: 24,
            total_space: 4096,
            max_replica_size: 512,
            abort_probability: 0.1,
            bad_checksum_probability: 0.05,
            max_open_readers: 4,
            abort_policy: AbortPolicy::MarkBroken,
            store_faults: SimulatedStoreConfig::no_faults(),
        }
    }
}

impl RepositoryDSTConfig {
    /// No aborted writes and no bad checksums
    pub fn baseline() -> Self {
        RepositoryDSTConfig {
            abort_probability: 0.0,
            bad_checksum_probability: 0.0,
            ..Default::default()
        }
    }

    /// Small pool, frequent aborts and checksum faults
    pub fn chaos() -> Self {
        RepositoryDSTConfig {
            total_space: 1024,
            abort_probability: 0.3,
            bad_checksum_probability: 0.2,
            max_open_readers: 8,
            store_faults: SimulatedStoreConfig::default(),
            ..Default::default()
        }
    }

    /// Frequent failures opening and deleting replica data
    pub fn storage_faults() -> Self {
        RepositoryDSTConfig {
            store_faults: SimulatedStoreConfig::high_chaos(),
            ..Default::default()
        }
    }

    /// Take pool size and abort policy from a repository configuration
    pub fn with_repository(mut self, repository: &RepositoryConfig) -> Self {
        self.total_space = repository.total_space;
        self.abort_policy = repository.abort_policy;
        self
    }

    /// Aborted writes delete the replica instead of marking it broken
    pub fn delete_on_abort() -> Self {
        RepositoryDSTConfig {
            abort_policy: AbortPolicy::Delete,
            abort_probability: 0.3,
            ..Default::default()
        }
    }
}

/// Records the last state seen per replica and any discontinuity
#[derive(Default)]
struct TransitionTracker {
    last: Mutex<HashMap<ReplicaId, EntryState>>,
    violations: Mutex<Vec<String>>,
    leaked: Mutex<usize>,
}

impl StateChangeListener for TransitionTracker {
    fn state_changed(&self, event: &StateChangeEvent) {
        let mut last = self.last.lock();
        let previous = last.get(&event.id).copied().unwrap_or(EntryState::New);
        // A destroyed identifier starts over when it is created again
        let previous = if previous == EntryState::Destroyed {
            EntryState::New
        } else {
            previous
        };
        if event.old_state() != previous {
            self.violations.lock().push(format!(
                "event for {} starts at {}, last seen {}",
                event.id,
                event.old_state(),
                previous
            ));
        }
        last.insert(event.id.clone(), event.new_state());
    }

    fn fault_occurred(&self, event: &FaultEvent) {
        if event.action == FaultAction::Leaked {
            *self.leaked.lock() += 1;
        }
    }
}

/// Repository DST Harness
pub struct RepositoryDSTHarness {
    seed: u64,
    rng: ChaCha8Rng,
    config: RepositoryDSTConfig,
}

impl RepositoryDSTHarness {
    pub fn new(seed: u64, config: RepositoryDSTConfig) -> Self {
        RepositoryDSTHarness {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            config,
        }
    }

    fn repository_config(&self) -> RepositoryConfig {
        let mut config = RepositoryConfig::test(self.config.total_space);
        config.abort_policy = self.config.abort_policy;
        config.checksum = ChecksumPolicy {
            types: vec![ChecksumType::Crc32],
            on_write: true,
        };
        config
    }

    /// Run a single DST scenario
    pub fn run(&mut self) -> RepositoryDSTResult {
        let mut result = RepositoryDSTResult {
            seed: self.seed,
            operations: 0,
            commits: 0,
            aborted_writes: 0,
            reads: 0,
            removals: 0,
            no_space: 0,
            checksum_faults: 0,
            storage_faults: 0,
            leaked: 0,
            passed: true,
            error_message: None,
        };

        let clock = SimulatedClock::new(1_000_000);
        let config = self.repository_config();
        let simulated = SimulatedReplicaStore::new(
            MemoryReplicaStore::new(),
            self.seed ^ 0x5eed_fa17,
            self.config.store_faults.clone(),
        );
        let store: Arc<dyn ReplicaStore> = Arc::new(ChecksumReplicaStore::new(
            simulated,
            config.checksum.types.clone(),
        ));
        let repo = ReplicaRepository::new(config, store, Arc::new(clock.clone()));
        let tracker = Arc::new(TransitionTracker::default());
        repo.add_listener(tracker.clone());

        let mut shadow: HashMap<ReplicaId, Bytes> = HashMap::new();
        let mut readers: Vec<ReadHandle> = Vec::new();

        for step in 0..self.config.num_operations {
            result.operations += 1;
            let outcome = self.step(&repo, &clock, &mut shadow, &mut readers, &mut result);
            shadow.retain(|id, _| is_readable(&repo, id));
            let checked = outcome.and_then(|()| check(&repo, &tracker, &shadow));
            if let Err(e) = checked {
                result.passed = false;
                result.error_message = Some(format!("step {}: {}", step, e));
                return result;
            }
        }

        for mut handle in readers.drain(..) {
            if let Err(e) = handle.close() {
                result.passed = false;
                result.error_message = Some(format!("closing reader: {}", e));
                return result;
            }
        }
        if let Err(e) = check(&repo, &tracker, &shadow) {
            result.passed = false;
            result.error_message = Some(format!("after closing readers: {}", e));
        }
        result.leaked = *tracker.leaked.lock();
        result
    }

    fn random_id(&mut self) -> ReplicaId {
        ReplicaId::from_u64(self.rng.gen_range(0..self.config.num_ids))
    }

    fn step(
        &mut self,
        repo: &ReplicaRepository,
        clock: &SimulatedClock,
        shadow: &mut HashMap<ReplicaId, Bytes>,
        readers: &mut Vec<ReadHandle>,
        result: &mut RepositoryDSTResult,
    ) -> Result<(), String> {
        match self.rng.gen_range(0..100) {
            0..=29 => self.create(repo, shadow, result),
            30..=49 => self.read(repo, shadow, readers, result),
            50..=57 => {
                if !readers.is_empty() {
                    let index = self.rng.gen_range(0..readers.len());
                    let mut handle = readers.swap_remove(index);
                    handle.close().map_err(|e| format!("close reader: {}", e))?;
                }
                Ok(())
            }
            58..=71 => self.change_state(repo, result),
            72..=81 => self.pin(repo, clock),
            82..=89 => {
                clock.advance_ms(self.rng.gen_range(100..5_000));
                repo.remove_expired_sticky();
                Ok(())
            }
            90..=94 => {
                let id = self.random_id();
                match repo.verify_checksum(&id) {
                    Ok(_) | Err(RepositoryError::NotFound(_)) | Err(RepositoryError::State(_)) => {
                        Ok(())
                    }
                    Err(RepositoryError::Io(_)) => {
                        result.storage_faults += 1;
                        Ok(())
                    }
                    Err(e) => Err(format!("verify {}: {}", id, e)),
                }
            }
            _ => {
                let id = self.random_id();
                match repo.mark_broken(&id) {
                    Ok(()) => {
                        shadow.remove(&id);
                        Ok(())
                    }
                    Err(RepositoryError::NotFound(_)) | Err(RepositoryError::State(_)) => Ok(()),
                    Err(e) => Err(format!("mark broken {}: {}", id, e)),
                }
            }
        }
    }

    fn create(
        &mut self,
        repo: &ReplicaRepository,
        shadow: &mut HashMap<ReplicaId, Bytes>,
        result: &mut RepositoryDSTResult,
    ) -> Result<(), String> {
        let id = self.random_id();
        let existed = repo.store().get(&id).is_some();
        let mut options = if self.rng.gen_bool(0.5) {
            CreateOptions::from_client()
        } else {
            CreateOptions::from_store()
        };
        if self.rng.gen_bool(0.2) {
            options = options.with_sticky("dst", Expiry::Never);
        }

        let mut handle = match repo.create_entry(&id, options) {
            Ok(handle) if existed => {
                return Err(format!("second create of {} succeeded: {:?}", id, handle));
            }
            Ok(handle) => handle,
            Err(RepositoryError::DuplicateEntry(_)) if existed => return Ok(()),
            Err(RepositoryError::Io(_)) if !existed => {
                // Failed to open the data: the new record is rolled back
                result.storage_faults += 1;
                if repo.store().get(&id).is_some() {
                    return Err(format!("failed create of {} left a record", id));
                }
                return Ok(());
            }
            Err(e) => return Err(format!("create {}: {}", id, e)),
        };

        let size = self.rng.gen_range(1..=self.config.max_replica_size);
        let mut data = vec![0u8; size];
        self.rng.fill(&mut data[..]);

        match handle.allocate(size as u64) {
            Ok(()) => {}
            Err(RepositoryError::NoSpace { .. }) => {
                result.no_space += 1;
                result.aborted_writes += 1;
                return handle.close().map_err(|e| format!("close {}: {}", id, e));
            }
            Err(e) => return Err(format!("allocate {}: {}", id, e)),
        }

        if self.rng.gen_bool(self.config.abort_probability) {
            let written = self.rng.gen_range(0..=size);
            handle
                .append(&data[..written])
                .map_err(|e| format!("append {}: {}", id, e))?;
            result.aborted_writes += 1;
            // Dropped without commit
            drop(handle);
            return Ok(());
        }

        handle
            .append(&data)
            .map_err(|e| format!("append {}: {}", id, e))?;

        let expected = if self.rng.gen_bool(self.config.bad_checksum_probability) {
            let bogus = ChecksumType::Crc32.digest(b"not the data");
            Some(bogus)
        } else {
            Some(ChecksumType::Crc32.digest(&data))
        };
        let wrong = expected != Some(ChecksumType::Crc32.digest(&data));

        match handle.commit(expected) {
            Ok(entry) => {
                if wrong {
                    return Err(format!("commit of {} accepted a wrong checksum", id));
                }
                if entry.size != size as u64 {
                    return Err(format!("{} committed {} bytes, wrote {}", id, entry.size, size));
                }
                result.commits += 1;
                shadow.insert(id.clone(), Bytes::from(data));
            }
            Err(RepositoryError::ChecksumMismatch { .. }) if wrong => {
                result.checksum_faults += 1;
                result.aborted_writes += 1;
            }
            Err(e) => return Err(format!("commit {}: {}", id, e)),
        }
        handle.close().map_err(|e| format!("close {}: {}", id, e))?;

        if wrong {
            let state = repo.store().get(&id).map(|r| {
                let meta = r.meta();
                (meta.state(), meta.is_broken())
            });
            match (self.config.abort_policy, state) {
                (AbortPolicy::MarkBroken, Some((_, true))) | (AbortPolicy::Delete, None) => {}
                (_, other) => {
                    return Err(format!("{} after checksum mismatch: {:?}", id, other));
                }
            }
        }
        Ok(())
    }

    fn read(
        &mut self,
        repo: &ReplicaRepository,
        shadow: &HashMap<ReplicaId, Bytes>,
        readers: &mut Vec<ReadHandle>,
        result: &mut RepositoryDSTResult,
    ) -> Result<(), String> {
        let id = self.random_id();
        let flags = if self.rng.gen_bool(0.2) {
            OpenFlags::NO_ATIME
        } else {
            OpenFlags::NONE
        };
        let mut handle = match repo.open_read(&id, flags) {
            Ok(handle) => handle,
            Err(RepositoryError::NotFound(_)) | Err(RepositoryError::State(_)) => {
                if shadow.contains_key(&id) {
                    return Err(format!("committed replica {} not readable", id));
                }
                return Ok(());
            }
            Err(RepositoryError::Io(_)) => {
                result.storage_faults += 1;
                return Ok(());
            }
            Err(e) => return Err(format!("open {}: {}", id, e)),
        };
        result.reads += 1;

        let data = handle
            .read_all()
            .map_err(|e| format!("read {}: {}", id, e))?;
        match shadow.get(&id) {
            Some(expected) if *expected == data => {}
            Some(expected) => {
                return Err(format!(
                    "{} returned {} bytes, {} committed",
                    id,
                    data.len(),
                    expected.len()
                ));
            }
            None => return Err(format!("{} readable but never committed", id)),
        }

        if readers.len() < self.config.max_open_readers && self.rng.gen_bool(0.5) {
            readers.push(handle);
            Ok(())
        } else {
            handle.close().map_err(|e| format!("close reader {}: {}", id, e))
        }
    }

    fn change_state(
        &mut self,
        repo: &ReplicaRepository,
        result: &mut RepositoryDSTResult,
    ) -> Result<(), String> {
        let id = self.random_id();
        let to = match self.rng.gen_range(0..3) {
            0 => EntryState::Cached,
            1 => EntryState::Precious,
            _ => EntryState::Removed,
        };
        let before = repo.store().get(&id).map(|r| {
            let state = r.meta().state();
            state
        });
        match repo.set_state(&id, to) {
            Ok(()) => {
                if to == EntryState::Removed && before.is_some_and(|s| !s.is_removed()) {
                    result.removals += 1;
                }
                Ok(())
            }
            Err(RepositoryError::IllegalTransition { from, .. }) => {
                let legal = matches!(from, EntryState::Cached | EntryState::Precious);
                if legal {
                    Err(format!("{} -> {} rejected for {}", from, to, id))
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(format!("set_state {} {}: {}", id, to, e)),
        }
    }

    fn pin(&mut self, repo: &ReplicaRepository, clock: &SimulatedClock) -> Result<(), String> {
        let id = self.random_id();
        let owner = format!("owner-{}", self.rng.gen_range(0..3));
        let expire = match self.rng.gen_range(0..4) {
            0 => Expiry::Never,
            // Already lapsed: clears the owner's pin
            1 => Expiry::At(clock.now()),
            _ => Expiry::At(clock.now() + Duration::from_millis(self.rng.gen_range(1..10_000))),
        };
        let overwrite = self.rng.gen_bool(0.5);
        match repo.set_sticky(&id, &owner, expire, overwrite) {
            Ok(_) | Err(RepositoryError::NotFound(_)) | Err(RepositoryError::State(_)) => Ok(()),
            Err(e) => Err(format!("set_sticky {}: {}", id, e)),
        }
    }
}

fn is_readable(repo: &ReplicaRepository, id: &ReplicaId) -> bool {
    repo.entry(id)
        .is_ok_and(|e| e.state.is_committed() && !e.broken)
}

fn check(
    repo: &ReplicaRepository,
    tracker: &TransitionTracker,
    shadow: &HashMap<ReplicaId, Bytes>,
) -> Result<(), String> {
    repo.check_invariants()?;

    if let Some(violation) = tracker.violations.lock().first() {
        return Err(format!("INVARIANT VIOLATION: {}", violation));
    }

    let space = repo.get_space_record();
    let entries = repo.entries();
    let precious: u64 = entries
        .iter()
        .filter(|e| e.is_precious())
        .map(|e| e.size)
        .sum();
    let removable: u64 = entries
        .iter()
        .filter(|e| e.is_removable())
        .map(|e| e.size)
        .sum();
    if precious != space.precious || removable != space.removable {
        return Err(format!(
            "INVARIANT VIOLATION: records imply precious {} removable {}, accountant has {} {}",
            precious, removable, space.precious, space.removable
        ));
    }
    if space.free + space.precious + space.removable > space.total {
        return Err(format!(
            "INVARIANT VIOLATION: free {} + precious {} + removable {} exceeds total {}",
            space.free, space.precious, space.removable, space.total
        ));
    }

    for entry in &entries {
        if let Some(data) = shadow.get(&entry.id) {
            if entry.state.is_committed() && !entry.broken && entry.size != data.len() as u64 {
                return Err(format!(
                    "INVARIANT VIOLATION: {} has size {}, committed {}",
                    entry.id,
                    entry.size,
                    data.len()
                ));
            }
        }
    }
    Ok(())
}

/// Run a batch of DST tests across multiple seeds
pub fn run_repository_dst_batch(
    seeds: std::ops::Range<u64>,
    config: RepositoryDSTConfig,
) -> Vec<RepositoryDSTResult> {
    seeds
        .map(|seed| {
            let mut harness = RepositoryDSTHarness::new(seed, config.clone());
            harness.run()
        })
        .collect()
}

/// Summarize batch results
pub fn summarize_repository_dst_batch(results: &[RepositoryDSTResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    let operations: usize = results.iter().map(|r| r.operations).sum();
    let commits: usize = results.iter().map(|r| r.commits).sum();
    let aborted: usize = results.iter().map(|r| r.aborted_writes).sum();
    let reads: usize = results.iter().map(|r| r.reads).sum();
    let removals: usize = results.iter().map(|r| r.removals).sum();
    let no_space: usize = results.iter().map(|r| r.no_space).sum();
    let checksum_faults: usize = results.iter().map(|r| r.checksum_faults).sum();
    let storage_faults: usize = results.iter().map(|r| r.storage_faults).sum();
    let leaked: usize = results.iter().map(|r| r.leaked).sum();

    let mut summary = format!(
        "Repository DST Batch: {}/{} passed ({} failed)\n\
         Operations: {}, Commits: {}, Aborted writes: {}, Reads: {}, Removals: {}, \
         No space: {}, Checksum faults: {}, Storage faults: {}, Leaked: {}",
        passed,
        total,
        failed,
        operations,
        commits,
        aborted,
        reads,
        removals,
        no_space,
        checksum_faults,
        storage_faults,
        leaked
    );

    if failed > 0 {
        summary.push_str("\n\nFailed seeds:");
        for r in results.iter().filter(|r| !r.passed) {
            summary.push_str(&format!(
                "\n  Seed {}: {}",
                r.seed,
                r.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_dst_baseline() {
        let results = run_repository_dst_batch(0..10, RepositoryDSTConfig::baseline());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
            assert!(r.commits > 0, "Seed {} committed nothing", r.seed);
            assert_eq!(r.checksum_faults, 0);
        }
    }

    #[test]
    fn test_repository_dst_is_deterministic() {
        let a = RepositoryDSTHarness::new(7, RepositoryDSTConfig::chaos()).run();
        let b = RepositoryDSTHarness::new(7, RepositoryDSTConfig::chaos()).run();
        assert_eq!(a.commits, b.commits);
        assert_eq!(a.aborted_writes, b.aborted_writes);
        assert_eq!(a.reads, b.reads);
        assert_eq!(a.removals, b.removals);
        assert_eq!(a.storage_faults, b.storage_faults);
        assert_eq!(a.leaked, b.leaked);
    }

    #[test]
    fn test_repository_dst_storage_faults_absorbed() {
        let results = run_repository_dst_batch(0..20, RepositoryDSTConfig::storage_faults());
        for r in &results {
            assert!(r.passed, "Seed {} failed: {:?}", r.seed, r.error_message);
        }
        assert!(results.iter().map(|r| r.storage_faults).sum::<usize>() > 0);
        assert!(results.iter().map(|r| r.leaked).sum::<usize>() > 0);
    }

    #[test]
    fn test_config_from_repository_section() {
        let mut repository = RepositoryConfig::test(8192);
        repository.abort_policy = AbortPolicy::Delete;
        let config = RepositoryDSTConfig::default().with_repository(&repository);
        assert_eq!(config.total_space, 8192);
        assert_eq!(config.abort_policy, AbortPolicy::Delete);
        assert_eq!(config.num_operations, RepositoryDSTConfig::default().num_operations);
    }
}
