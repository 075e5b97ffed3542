//! Nearline Removal Integration Tests
//!
//! Batches through `RemovalCoordinator` with scripted command outcomes.

use parking_lot::Mutex;
use replica_pool::config::NearlineConfig;
use replica_pool::nearline::{
    HsmConfig, RemovalCoordinator, RemovalError, RemovalReply, RemovalResult, RemovalTarget,
    ReplyError, SimulatedRunner,
};
use replica_pool::repository::ReplicaId;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config() -> NearlineConfig {
    let mut config = NearlineConfig::test();
    config.hsm = vec![
        HsmConfig::new("tape-a", "osm")
            .with_attribute("command", "/usr/share/pool/hsm.sh")
            .with_attribute("c", "1:2"),
        HsmConfig::new("tape-b", "osm"),
    ];
    config
}

fn targets(n: u64) -> Vec<RemovalTarget> {
    (1..=n)
        .map(|i| RemovalTarget::new(ReplicaId::from_u64(i), format!("osm://tape-a/item-{}", i)))
        .collect()
}

fn ids(ns: &[u64]) -> Vec<ReplicaId> {
    ns.iter().map(|n| ReplicaId::from_u64(*n)).collect()
}

#[derive(Default)]
struct CapturingReply {
    results: Mutex<Vec<RemovalResult>>,
}

impl RemovalReply for CapturingReply {
    fn reply(&self, result: RemovalResult) -> Result<(), ReplyError> {
        self.results.lock().push(result);
        Ok(())
    }
}

struct GoneReply;

impl RemovalReply for GoneReply {
    fn reply(&self, _result: RemovalResult) -> Result<(), ReplyError> {
        Err(ReplyError::Unreachable("requester left".to_string()))
    }
}

#[tokio::test]
async fn test_partial_failure_does_not_fail_batch() {
    let runner = Arc::new(SimulatedRunner::new().fail_matching("item-3", 2));
    let coordinator = RemovalCoordinator::new(&config(), runner.clone());
    let reply = CapturingReply::default();

    let result = coordinator
        .process(&targets(5), &reply, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.succeeded, ids(&[1, 2, 4, 5]));
    assert_eq!(result.failed, ids(&[3]));
    assert_eq!(reply.results.lock().as_slice(), &[result]);
    assert_eq!(runner.executed().len(), 5);
}

#[tokio::test]
async fn test_missing_backend_fails_before_any_command() {
    let runner = Arc::new(SimulatedRunner::new());
    let coordinator = RemovalCoordinator::new(&config(), runner.clone());
    let mut batch = targets(3);
    batch.push(RemovalTarget::new(
        ReplicaId::from_u64(9),
        "enstore://robot/item-9",
    ));

    let err = coordinator
        .remove(&batch, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RemovalError::Configuration(_)));
    assert!(runner.executed().is_empty());
}

#[tokio::test]
async fn test_backend_without_command_is_configuration_error() {
    let coordinator = RemovalCoordinator::new(&config(), Arc::new(SimulatedRunner::new()));
    let batch = vec![RemovalTarget::new(ReplicaId::from_u64(1), "osm://tape-b/x")];
    let err = coordinator
        .remove(&batch, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("command"));
}

#[tokio::test]
async fn test_unreachable_requester_is_not_an_error() {
    let coordinator = RemovalCoordinator::new(&config(), Arc::new(SimulatedRunner::new()));
    let result = coordinator
        .process(&targets(2), &GoneReply, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.succeeded, ids(&[1, 2]));
}

#[tokio::test]
async fn test_cancellation_interrupts_without_reply() {
    let runner = Arc::new(SimulatedRunner::new().with_delay(Duration::from_secs(30)));
    let coordinator = RemovalCoordinator::new(&config(), runner);
    let reply = CapturingReply::default();
    let cancel = CancellationToken::new();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator.process(&targets(3), &reply, &cancel),
    )
    .await
    .expect("interruption must not wait for the commands")
    .unwrap_err();
    assert_eq!(err, RemovalError::Interrupted);
    assert!(reply.results.lock().is_empty());
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let mut cfg = config();
    cfg.max_active_removes = 2;
    let runner = Arc::new(SimulatedRunner::new().with_delay(Duration::from_millis(100)));
    let coordinator = RemovalCoordinator::new(&cfg, runner.clone());

    let cancel = CancellationToken::new();
    let batch = targets(6);
    let removal = coordinator.remove(&batch, &cancel);
    tokio::pin!(removal);

    // Only the first two commands can have started
    let early = tokio::time::timeout(Duration::from_millis(50), &mut removal).await;
    assert!(early.is_err());
    assert_eq!(runner.executed().len(), 2);

    let result = removal.await.unwrap();
    assert_eq!(result.succeeded.len(), 6);
}

#[tokio::test]
async fn test_command_line_format() {
    let runner = Arc::new(SimulatedRunner::new());
    let coordinator = RemovalCoordinator::new(&config(), runner.clone());
    coordinator
        .remove(&targets(1), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(
        runner.executed(),
        vec![
            "/usr/share/pool/hsm.sh remove -uri=osm://tape-a/item-1 -c=1:2 \
             -command=/usr/share/pool/hsm.sh"
                .to_string()
        ]
    );
}
