//! State Change Notifier Integration Tests
//!
//! Delivery order and fault isolation through a repository running in
//! ordered (background task) notification mode.

use parking_lot::Mutex;
use replica_pool::clock::SimulatedClock;
use replica_pool::config::RepositoryConfig;
use replica_pool::repository::{
    CreateOptions, EntryState, FaultAction, FaultEvent, MemoryReplicaStore, NotificationMode,
    ReplicaId, ReplicaRepository, StateChangeEvent, StateChangeListener, StateChangeNotifier,
    StickyChangeEvent,
};
use std::sync::Arc;

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(ReplicaId, EntryState, EntryState)>>,
    sticky: Mutex<usize>,
}

impl StateChangeListener for Recorder {
    fn state_changed(&self, event: &StateChangeEvent) {
        self.seen
            .lock()
            .push((event.id.clone(), event.old_state(), event.new_state()));
    }

    fn sticky_changed(&self, _event: &StickyChangeEvent) {
        *self.sticky.lock() += 1;
    }
}

/// Fails on every event
struct Faulty;

impl StateChangeListener for Faulty {
    fn state_changed(&self, event: &StateChangeEvent) {
        panic!("listener failure on {}", event.id);
    }

    fn sticky_changed(&self, event: &StickyChangeEvent) {
        panic!("listener failure on {}", event.id);
    }
}

fn ordered_repository() -> ReplicaRepository {
    let mut config = RepositoryConfig::test(1 << 20);
    config.notification = NotificationMode::Ordered;
    ReplicaRepository::new(
        config,
        Arc::new(MemoryReplicaStore::new()),
        Arc::new(SimulatedClock::new(0)),
    )
}

#[tokio::test]
async fn test_faulty_middle_listener_does_not_disturb_others() {
    let repo = ordered_repository();
    let first = Arc::new(Recorder::default());
    let third = Arc::new(Recorder::default());
    repo.add_listener(first.clone());
    repo.add_listener(Arc::new(Faulty));
    repo.add_listener(third.clone());

    for n in 0..20 {
        let id = ReplicaId::from_u64(n);
        let mut handle = repo.create_entry(&id, CreateOptions::from_store()).unwrap();
        handle.allocate(4).unwrap();
        handle.append(b"data").unwrap();
        handle.commit(None).unwrap();
        handle.close().unwrap();
        repo.set_sticky(&id, "pin", replica_pool::repository::Expiry::Never, false)
            .unwrap();
        if n % 2 == 0 {
            repo.set_state(&id, EntryState::Precious).unwrap();
        }
    }
    repo.flush().await;

    let first_seen = first.seen.lock().clone();
    let third_seen = third.seen.lock().clone();
    // create + commit per replica, plus 10 precious transitions
    assert_eq!(first_seen.len(), 50);
    assert_eq!(first_seen, third_seen);
    assert_eq!(*first.sticky.lock(), 20);
    assert_eq!(*third.sticky.lock(), 20);

    // Production order: each replica's events are contiguous and in lifecycle order
    for (n, chunk) in first_seen
        .chunk_by(|a, b| a.0 == b.0)
        .enumerate()
    {
        let id = ReplicaId::from_u64(n as u64);
        let states: Vec<_> = chunk.iter().map(|(_, from, to)| (*from, *to)).collect();
        assert!(chunk.iter().all(|(e, _, _)| *e == id));
        assert_eq!(states[0], (EntryState::New, EntryState::FromStore));
        assert_eq!(states[1], (EntryState::FromStore, EntryState::Cached));
        if n % 2 == 0 {
            assert_eq!(states[2], (EntryState::Cached, EntryState::Precious));
        }
    }
}

#[tokio::test]
async fn test_removed_listener_stops_receiving() {
    let repo = ordered_repository();
    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn StateChangeListener> = recorder.clone();
    repo.add_listener(listener.clone());

    let id = ReplicaId::from_u64(1);
    let mut handle = repo.create_entry(&id, CreateOptions::from_store()).unwrap();
    repo.flush().await;
    assert_eq!(recorder.seen.lock().len(), 1);

    assert!(repo.remove_listener(&listener));
    assert!(!repo.remove_listener(&listener));
    handle.commit(None).unwrap();
    handle.close().unwrap();
    repo.flush().await;
    assert_eq!(recorder.seen.lock().len(), 1);
}

#[tokio::test]
async fn test_shutdown_drains_queue() {
    let repo = ordered_repository();
    let recorder = Arc::new(Recorder::default());
    repo.add_listener(recorder.clone());

    for n in 0..10 {
        let mut handle = repo
            .create_entry(&ReplicaId::from_u64(n), CreateOptions::from_client())
            .unwrap();
        handle.commit(None).unwrap();
        handle.close().unwrap();
    }
    repo.shutdown().await;
    assert_eq!(recorder.seen.lock().len(), 20);
}

#[derive(Default)]
struct FaultRecorder {
    faults: Mutex<Vec<FaultEvent>>,
}

impl StateChangeListener for FaultRecorder {
    fn state_changed(&self, _event: &StateChangeEvent) {}

    fn fault_occurred(&self, event: &FaultEvent) {
        self.faults.lock().push(event.clone());
    }
}

#[tokio::test]
async fn test_synchronous_notifier_delivers_inline() {
    let notifier = StateChangeNotifier::synchronous();
    assert_eq!(notifier.mode(), NotificationMode::Synchronous);
    let recorder = Arc::new(FaultRecorder::default());
    notifier.add_listener(Arc::new(Faulty));
    notifier.add_listener(recorder.clone());

    notifier.submit(replica_pool::repository::RepositoryEvent::Fault(FaultEvent {
        id: None,
        action: FaultAction::Leaked,
        message: "disk gone".to_string(),
        timestamp: replica_pool::Timestamp::ZERO,
    }));
    assert_eq!(recorder.faults.lock().len(), 1);
    assert_eq!(notifier.listener_count(), 2);

    notifier.shutdown().await;
    assert!(notifier.is_shut_down());
}
