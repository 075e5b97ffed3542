//! Bulk removal of replicas from nearline storage
//!
//! A batch of targets is turned into one external command per target. The
//! commands run concurrently as tokio tasks, bounded by a semaphore and each
//! under its own timeout. Results are collected in submission order and
//! reported back as one `RemovalResult`.
//!
//! ```text
//!   targets ──► build commands ──► spawn tasks ──► await in order ──► reply
//!                    │                  │                 │
//!            Configuration error   Semaphore(max)    exit 0: succeeded
//!            (nothing spawned)     timeout(each)     else:   failed
//! ```
//!
//! ## Faults
//!
//! - A failing or timed-out command only fails its own target.
//! - An unreachable reply channel is logged and ignored: the removals have
//!   already happened and a retried request finds the targets gone.
//! - Cancellation aborts outstanding tasks and returns `Interrupted`
//!   without replying.
//! - A removal task that panicked or was cancelled by anyone else is a bug
//!   in this module, and is re-raised as a panic.

use crate::config::NearlineConfig;
use crate::nearline::hsm::HsmSet;
use crate::nearline::runner::CommandRunner;
use crate::repository::id::ReplicaId;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemovalError {
    /// A target's backend, or the backend's command, is not configured
    Configuration(String),
    /// The batch was cancelled while waiting for results
    Interrupted,
}

impl std::fmt::Display for RemovalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            RemovalError::Interrupted => write!(f, "Removal interrupted"),
        }
    }
}

impl std::error::Error for RemovalError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    Unreachable(String),
}

impl std::fmt::Display for ReplyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyError::Unreachable(msg) => write!(f, "Requester unreachable: {}", msg),
        }
    }
}

impl std::error::Error for ReplyError {}

// ============================================================================
// Requests and results
// ============================================================================

/// One replica to remove and its nearline location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalTarget {
    pub id: ReplicaId,
    pub uri: String,
}

impl RemovalTarget {
    pub fn new(id: ReplicaId, uri: impl Into<String>) -> Self {
        RemovalTarget {
            id,
            uri: uri.into(),
        }
    }
}

/// Outcome of a batch, ids in submission order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemovalResult {
    pub succeeded: Vec<ReplicaId>,
    pub failed: Vec<ReplicaId>,
}

impl RemovalResult {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Return path to whoever requested the removal
pub trait RemovalReply: Send + Sync {
    fn reply(&self, result: RemovalResult) -> Result<(), ReplyError>;
}

#[derive(Debug)]
enum Outcome {
    Exited(i32),
    Failed(std::io::Error),
    TimedOut,
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct RemovalCoordinator {
    hsm: Arc<HsmSet>,
    runner: Arc<dyn CommandRunner>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl RemovalCoordinator {
    pub fn new(config: &NearlineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        RemovalCoordinator {
            hsm: Arc::new(HsmSet::new(config.hsm.clone())),
            runner,
            permits: Arc::new(Semaphore::new(config.max_active_removes.max(1))),
            timeout: config.remove_timeout,
        }
    }

    pub fn hsm(&self) -> &HsmSet {
        &self.hsm
    }

    /// Remove every target, returning which succeeded and which failed.
    ///
    /// All commands are built before any is started, so a configuration
    /// error leaves nothing half done.
    pub async fn remove(
        &self,
        targets: &[RemovalTarget],
        cancel: &CancellationToken,
    ) -> Result<RemovalResult, RemovalError> {
        let commands = targets
            .iter()
            .map(|t| self.hsm.build_remove_command(&t.uri))
            .collect::<Result<Vec<_>, _>>()?;

        info!("Removing {} replica(s) from nearline storage", targets.len());

        let mut pending: VecDeque<(&RemovalTarget, JoinHandle<Outcome>)> = targets
            .iter()
            .zip(commands)
            .map(|(target, command)| (target, self.spawn(command)))
            .collect();

        let mut result = RemovalResult::default();
        while let Some((target, mut task)) = pending.pop_front() {
            let joined = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                joined = &mut task => Some(joined),
            };
            let Some(joined) = joined else {
                task.abort();
                for (_, rest) in &pending {
                    rest.abort();
                }
                warn!(
                    "Removal batch interrupted with {} task(s) outstanding",
                    pending.len() + 1
                );
                return Err(RemovalError::Interrupted);
            };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => panic!("Removal task for {} cancelled externally: {}", target.id, e),
            };

            match outcome {
                Outcome::Exited(0) => {
                    debug!("Removed {} from {}", target.id, target.uri);
                    result.succeeded.push(target.id.clone());
                }
                Outcome::Exited(code) => {
                    warn!(
                        "Failed to remove {} from {}: command exited with {}",
                        target.id, target.uri, code
                    );
                    result.failed.push(target.id.clone());
                }
                Outcome::Failed(e) => {
                    warn!("Failed to remove {} from {}: {}", target.id, target.uri, e);
                    result.failed.push(target.id.clone());
                }
                Outcome::TimedOut => {
                    warn!(
                        "Failed to remove {} from {}: timed out after {:?}",
                        target.id, target.uri, self.timeout
                    );
                    result.failed.push(target.id.clone());
                }
            }
        }

        info!(
            "Nearline removal finished: {} succeeded, {} failed",
            result.succeeded.len(),
            result.failed.len()
        );
        Ok(result)
    }

    /// Remove every target and report the result to `reply`.
    ///
    /// An unreachable requester is not an error.
    pub async fn process(
        &self,
        targets: &[RemovalTarget],
        reply: &dyn RemovalReply,
        cancel: &CancellationToken,
    ) -> Result<RemovalResult, RemovalError> {
        let result = self.remove(targets, cancel).await?;
        if let Err(e) = reply.reply(result.clone()) {
            warn!("Could not report removal result: {}", e);
        }
        Ok(result)
    }

    fn spawn(&self, command: String) -> JoinHandle<Outcome> {
        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .expect("removal semaphore is never closed");
            debug!("Executing: {}", command);
            match tokio::time::timeout(timeout, runner.run(&command)).await {
                Ok(Ok(code)) => Outcome::Exited(code),
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::TimedOut,
            }
        })
    }
}
