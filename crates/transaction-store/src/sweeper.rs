//! Background sweep for expired and retained transactions.

use std::sync::{Arc, Weak};

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::store::{TransactionStorage, TransactionTimeoutHandler};
use crate::config::MIN_SWEEP_INTERVAL;
use crate::{Result, StorageConfig, TransactionQuery};

/// Outcome of a single sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired transactions handed to the timeout handler.
    pub expired: usize,
    /// Finished transactions removed by the retention policy.
    pub purged: usize,
}

/// Periodically hands expired transactions to the registered
/// [`TransactionTimeoutHandler`] and applies the retention policy.
///
/// Shared by the storage adapters; each adapter owns one sweeper.
#[derive(Clone, Default)]
pub struct TimeoutSweeper {
    handler: Arc<RwLock<Option<Weak<dyn TransactionTimeoutHandler>>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TimeoutSweeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the handler notified about expired transactions.
    pub async fn set_handler(&self, handler: Weak<dyn TransactionTimeoutHandler>) {
        *self.handler.write().await = Some(handler);
    }

    /// Runs one sweep pass against the given storage.
    pub async fn sweep(
        &self,
        storage: &dyn TransactionStorage,
        config: &StorageConfig,
    ) -> Result<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let handler = self.handler.read().await.as_ref().and_then(|h| h.upgrade());
        if let Some(handler) = handler {
            let expired = storage.list(TransactionQuery::expired(now)).await?;
            for checkpoint in expired {
                tracing::info!(
                    workflow_id = %checkpoint.workflow_id(),
                    transaction_id = %checkpoint.transaction_id(),
                    "transaction timed out"
                );
                handler
                    .on_transaction_timeout(checkpoint.workflow_id(), checkpoint.transaction_id())
                    .await;
                report.expired += 1;
            }
        }

        if let Some(retention) = config.retention
            && let Some(cutoff) = chrono::Duration::from_std(retention)
                .ok()
                .and_then(|window| now.checked_sub_signed(window))
        {
            report.purged = storage.purge_finished(cutoff).await?;
        }

        if report.purged > 0 {
            metrics::counter!("transaction_store_purged_total").increment(report.purged as u64);
        }

        Ok(report)
    }

    /// Spawns the sweep loop if it is not running yet.
    pub async fn start(&self, storage: Arc<dyn TransactionStorage>, config: StorageConfig) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let sweeper = self.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.sweep_interval.max(MIN_SWEEP_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.sweep(storage.as_ref(), &config).await {
                    tracing::warn!(error = %e, "transaction sweep failed");
                }
            }
        }));
        tracing::debug!("transaction sweeper started");
    }

    /// Stops the sweep loop.
    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
            tracing::debug!("transaction sweeper stopped");
        }
    }

    /// Returns true while the sweep loop is running.
    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }
}
