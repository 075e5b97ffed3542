//! State change notifier
//!
//! Decouples the producers of events (any task mutating a record) from their
//! delivery to listeners.
//!
//! ## Architecture
//!
//! ```text
//! Producer 1 ──┐
//! Producer 2 ──┤──► NotifierActor ──► listener 1 ──► listener 2 ──► ...
//! Producer 3 ──┘    (one task, FIFO)
//! ```
//!
//! ## Modes
//!
//! - **Ordered**: events are queued on an unbounded channel and delivered by
//!   a single task in submission order. Producers never wait for listeners.
//! - **Synchronous**: events are delivered inline on the producer's task.
//!   Used by tests that want to observe effects without flushing.
//!
//! In both modes a listener that panics is logged and skipped for that event;
//! the remaining listeners still receive it.

use crate::repository::events::{dispatch, RepositoryEvent, StateChangeListener};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Delivery mode for the notifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationMode {
    #[default]
    Ordered,
    Synchronous,
}

type ListenerList = Arc<Vec<Arc<dyn StateChangeListener>>>;

/// Copy-on-write listener list: delivery iterates a snapshot, so listeners
/// can be added or removed while an event is being delivered.
#[derive(Clone, Default)]
struct Listeners(Arc<RwLock<ListenerList>>);

impl Listeners {
    fn add(&self, listener: Arc<dyn StateChangeListener>) {
        let mut guard = self.0.write();
        let mut next: Vec<_> = (**guard).clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    fn remove(&self, listener: &Arc<dyn StateChangeListener>) -> bool {
        let mut guard = self.0.write();
        let before = guard.len();
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(*l, listener))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    fn snapshot(&self) -> ListenerList {
        self.0.read().clone()
    }

    fn deliver(&self, event: &RepositoryEvent) {
        let listeners = self.snapshot();
        for (index, listener) in listeners.iter().enumerate() {
            let result = catch_unwind(AssertUnwindSafe(|| dispatch(listener.as_ref(), event)));
            if let Err(panic) = result {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    "Listener {} failed on event for {:?}: {}",
                    index,
                    event.id(),
                    msg
                );
            }
        }
    }
}

/// Messages for the notifier actor
enum NotifierMessage {
    Event(Box<RepositoryEvent>),
    /// Reply once every event queued before this message was delivered
    Flush { response_tx: oneshot::Sender<()> },
    Shutdown { response_tx: oneshot::Sender<()> },
}

/// Single consumer that delivers events in queue order
struct NotifierActor {
    listeners: Listeners,
    rx: mpsc::UnboundedReceiver<NotifierMessage>,
}

impl NotifierActor {
    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                NotifierMessage::Event(event) => self.listeners.deliver(&event),
                NotifierMessage::Flush { response_tx } => {
                    let _ = response_tx.send(());
                }
                NotifierMessage::Shutdown { response_tx } => {
                    info!("Notifier shutting down");
                    self.drain();
                    let _ = response_tx.send(());
                    break;
                }
            }
        }
    }

    /// Stop accepting messages and deliver whatever raced in behind the
    /// shutdown request
    fn drain(&mut self) {
        self.rx.close();
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                NotifierMessage::Event(event) => self.listeners.deliver(&event),
                NotifierMessage::Flush { response_tx }
                | NotifierMessage::Shutdown { response_tx } => {
                    let _ = response_tx.send(());
                }
            }
        }
    }
}

enum Delivery {
    Synchronous,
    Ordered(mpsc::UnboundedSender<NotifierMessage>),
}

/// Fan-out of repository events to registered listeners
pub struct StateChangeNotifier {
    listeners: Listeners,
    delivery: Delivery,
    shut_down: AtomicBool,
}

impl StateChangeNotifier {
    /// Create a notifier. Ordered mode spawns the delivery task and must be
    /// called from within a tokio runtime.
    pub fn new(mode: NotificationMode) -> Self {
        match mode {
            NotificationMode::Ordered => Self::ordered(),
            NotificationMode::Synchronous => Self::synchronous(),
        }
    }

    pub fn synchronous() -> Self {
        StateChangeNotifier {
            listeners: Listeners::default(),
            delivery: Delivery::Synchronous,
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn ordered() -> Self {
        let listeners = Listeners::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = NotifierActor {
            listeners: listeners.clone(),
            rx,
        };
        tokio::spawn(actor.run());
        StateChangeNotifier {
            listeners,
            delivery: Delivery::Ordered(tx),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> NotificationMode {
        match self.delivery {
            Delivery::Synchronous => NotificationMode::Synchronous,
            Delivery::Ordered(_) => NotificationMode::Ordered,
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners.add(listener);
    }

    /// Returns whether the listener was registered
    pub fn remove_listener(&self, listener: &Arc<dyn StateChangeListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.snapshot().len()
    }

    /// Queue an event for delivery. Never blocks on listeners in ordered mode.
    pub fn submit(&self, event: RepositoryEvent) {
        if self.shut_down.load(Ordering::Acquire) {
            debug!("Notifier shut down, dropping event for {:?}", event.id());
            return;
        }
        match &self.delivery {
            Delivery::Synchronous => self.listeners.deliver(&event),
            Delivery::Ordered(tx) => {
                if tx.send(NotifierMessage::Event(Box::new(event))).is_err() {
                    debug!("Notifier task gone, dropping event");
                }
            }
        }
    }

    /// Wait until every event submitted so far has been delivered
    pub async fn flush(&self) {
        if let Delivery::Ordered(tx) = &self.delivery {
            let (response_tx, response_rx) = oneshot::channel();
            if tx.send(NotifierMessage::Flush { response_tx }).is_ok() {
                let _ = response_rx.await;
            }
        }
    }

    /// Deliver what is queued, then stop. Later submissions are dropped.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Delivery::Ordered(tx) = &self.delivery {
            let (response_tx, response_rx) = oneshot::channel();
            if tx.send(NotifierMessage::Shutdown { response_tx }).is_ok() {
                let _ = response_rx.await;
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Timestamp;
    use crate::repository::events::{FaultAction, FaultEvent, StateChangeEvent};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl StateChangeListener for Recorder {
        fn state_changed(&self, _event: &StateChangeEvent) {}

        fn fault_occurred(&self, event: &FaultEvent) {
            self.seen.lock().push(event.message.clone());
        }
    }

    struct Panicker;

    impl StateChangeListener for Panicker {
        fn state_changed(&self, _event: &StateChangeEvent) {}

        fn fault_occurred(&self, _event: &FaultEvent) {
            panic!("listener bug");
        }
    }

    fn fault(msg: &str) -> RepositoryEvent {
        RepositoryEvent::Fault(FaultEvent {
            id: None,
            action: FaultAction::Leaked,
            message: msg.to_string(),
            timestamp: Timestamp(0),
        })
    }

    #[test]
    fn test_synchronous_delivery_is_inline() {
        let notifier = StateChangeNotifier::synchronous();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone());
        notifier.submit(fault("a"));
        assert_eq!(*recorder.seen.lock(), vec!["a"]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let notifier = StateChangeNotifier::synchronous();
        let first = Arc::new(Recorder::default());
        let third = Arc::new(Recorder::default());
        notifier.add_listener(first.clone());
        notifier.add_listener(Arc::new(Panicker));
        notifier.add_listener(third.clone());

        notifier.submit(fault("a"));
        notifier.submit(fault("b"));
        assert_eq!(*first.seen.lock(), vec!["a", "b"]);
        assert_eq!(*third.seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_remove_listener() {
        let notifier = StateChangeNotifier::synchronous();
        let recorder = Arc::new(Recorder::default());
        let as_dyn: Arc<dyn StateChangeListener> = recorder.clone();
        notifier.add_listener(as_dyn.clone());
        assert!(notifier.remove_listener(&as_dyn));
        assert!(!notifier.remove_listener(&as_dyn));
        notifier.submit(fault("a"));
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_ordered_delivery_and_flush() {
        let notifier = StateChangeNotifier::ordered();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone());
        for i in 0..100 {
            notifier.submit(fault(&i.to_string()));
        }
        notifier.flush().await;
        let expected: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        assert_eq!(*recorder.seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_drops() {
        let notifier = StateChangeNotifier::ordered();
        let recorder = Arc::new(Recorder::default());
        notifier.add_listener(recorder.clone());
        notifier.submit(fault("before"));
        notifier.shutdown().await;
        notifier.submit(fault("after"));
        assert_eq!(*recorder.seen.lock(), vec!["before"]);
        assert!(notifier.is_shut_down());
    }

    #[tokio::test]
    async fn test_event_queued_behind_shutdown_is_delivered() {
        let listeners = Listeners::default();
        let recorder = Arc::new(Recorder::default());
        listeners.add(recorder.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        // A producer that passed the shutdown check just before the flag flipped
        let (response_tx, response_rx) = oneshot::channel();
        tx.send(NotifierMessage::Event(Box::new(fault("before"))))
            .unwrap();
        tx.send(NotifierMessage::Shutdown { response_tx }).unwrap();
        tx.send(NotifierMessage::Event(Box::new(fault("raced"))))
            .unwrap();

        NotifierActor { listeners, rx }.run().await;
        response_rx.await.unwrap();
        assert_eq!(*recorder.seen.lock(), vec!["before", "raced"]);
        assert!(tx
            .send(NotifierMessage::Event(Box::new(fault("late"))))
            .is_err());
    }
}
