//! Sticky expiration worker
//!
//! Drops lapsed pins on a fixed interval so that their replicas count as
//! removable space again. Stopped through a `CancellationToken`.
//!
//! ```text
//! interval tick ──► remove_expired_sticky() ──► StickyChangeEvent per replica
//! ```

use crate::repository::repository::ReplicaRepository;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Background task sweeping lapsed pins on a fixed interval
pub struct ExpirationWorker {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl ExpirationWorker {
    pub(crate) fn spawn(repository: ReplicaRepository, period: Duration) -> Self {
        let token = CancellationToken::new();
        let task = tokio::spawn(run(repository, period, token.clone()));
        ExpirationWorker { token, task }
    }

    /// Token that stops the worker when cancelled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the worker and wait for it to finish
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

async fn run(repository: ReplicaRepository, period: Duration, token: CancellationToken) {
    info!("Sticky expiration worker started, sweeping every {:?}", period);
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                debug!("Sweeping expired sticky records");
                let expired = repository.remove_expired_sticky();
                if !expired.is_empty() {
                    debug!("Expired pins on {} replica(s)", expired.len());
                }
            }
        }
    }
    info!("Sticky expiration worker stopped");
}
