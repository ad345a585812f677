//! Background sweep for abandoned transactions.
//!
//! Callers that begin a transaction and never commit or roll it back would
//! otherwise leak contexts forever. The reaper periodically force-rolls-back
//! every active context older than the configured maximum age, and evicts
//! contexts whose commit or rollback has hung for that long.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::transaction::coordinator::TransactionCoordinator;

/// Spawns the periodic stale-transaction sweep.
pub struct StaleTransactionReaper;

impl StaleTransactionReaper {
    /// Start sweeping with the coordinator's configured interval and age.
    pub fn spawn(coordinator: TransactionCoordinator) -> ReaperHandle {
        let config = coordinator.config();
        let (interval, max_age) = (config.reap_interval, config.stale_after);
        Self::spawn_with(coordinator, interval, max_age)
    }

    /// Start sweeping every `interval`, reaping contexts older than `max_age`.
    pub fn spawn_with(
        coordinator: TransactionCoordinator,
        interval: Duration,
        max_age: Duration,
    ) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(interval_ms = period.as_millis() as u64, "stale transaction reaper started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let reaped = coordinator.cleanup_stale_transactions(max_age).await;
                        debug!(reaped, "reaper sweep");
                    }
                }
            }
            info!("stale transaction reaper stopped");
        });

        ReaperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Controls a running reaper. Dropping the handle stops the sweep.
#[derive(Debug)]
pub struct ReaperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ReaperHandle {
    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}
