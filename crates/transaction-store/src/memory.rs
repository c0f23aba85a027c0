use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TransactionId;
use tokio::sync::RwLock;

use crate::store::{SaveOptions, TransactionStorage, TransactionTimeoutHandler};
use crate::sweeper::{SweepReport, TimeoutSweeper};
use crate::{
    Result, StorageConfig, StorageError, TransactionCheckpoint, TransactionQuery, Version,
};

type Key = (String, TransactionId);

/// Volatile, process-local transaction storage.
///
/// State is lost on restart; adequate for single-instance deployments and tests.
#[derive(Clone, Default)]
pub struct InMemoryTransactionStorage {
    transactions: Arc<RwLock<HashMap<Key, TransactionCheckpoint>>>,
    config: StorageConfig,
    sweeper: TimeoutSweeper,
}

impl InMemoryTransactionStorage {
    /// Creates a new empty storage with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new empty storage with the given configuration.
    pub fn with_config(config: StorageConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Returns the number of stored transactions.
    pub async fn transaction_count(&self) -> usize {
        self.transactions.read().await.len()
    }

    /// Clears all transactions.
    pub async fn clear(&self) {
        self.transactions.write().await.clear();
    }

    /// Runs one sweep pass immediately.
    pub async fn sweep_now(&self) -> Result<SweepReport> {
        self.sweeper.sweep(self, &self.config).await
    }
}

#[async_trait]
impl TransactionStorage for InMemoryTransactionStorage {
    async fn get(
        &self,
        workflow_id: &str,
        transaction_id: &TransactionId,
    ) -> Result<Option<TransactionCheckpoint>> {
        let store = self.transactions.read().await;
        Ok(store
            .get(&(workflow_id.to_string(), transaction_id.clone()))
            .cloned())
    }

    async fn save(
        &self,
        checkpoint: &TransactionCheckpoint,
        options: SaveOptions,
    ) -> Result<Version> {
        let key = (
            checkpoint.workflow_id().to_string(),
            checkpoint.transaction_id().clone(),
        );

        let mut store = self.transactions.write().await;

        let current_version = store
            .get(&key)
            .map(|stored| stored.version)
            .unwrap_or(Version::initial());

        if let Some(expected) = options.expected_version
            && current_version != expected
        {
            return Err(StorageError::ConcurrencyConflict {
                workflow_id: key.0,
                transaction_id: key.1,
                expected,
                actual: current_version,
            });
        }

        let next_version = current_version.next();
        let mut stored = checkpoint.clone();
        stored.version = next_version;
        stored.flow.updated_at = Utc::now();
        store.insert(key, stored);

        metrics::counter!("transaction_store_saves_total").increment(1);
        Ok(next_version)
    }

    async fn list(&self, query: TransactionQuery) -> Result<Vec<TransactionCheckpoint>> {
        let store = self.transactions.read().await;
        let mut checkpoints: Vec<_> = store
            .values()
            .filter(|checkpoint| query.matches(checkpoint))
            .cloned()
            .collect();

        checkpoints.sort_by(|a, b| {
            a.flow
                .created_at
                .cmp(&b.flow.created_at)
                .then_with(|| a.transaction_id().cmp(b.transaction_id()))
        });

        let offset = query.offset.unwrap_or(0);
        let checkpoints = checkpoints.into_iter().skip(offset);
        let checkpoints = match query.limit {
            Some(limit) => checkpoints.take(limit).collect(),
            None => checkpoints.collect(),
        };

        Ok(checkpoints)
    }

    async fn delete(&self, workflow_id: &str, transaction_id: &TransactionId) -> Result<bool> {
        let mut store = self.transactions.write().await;
        Ok(store
            .remove(&(workflow_id.to_string(), transaction_id.clone()))
            .is_some())
    }

    async fn purge_finished(&self, updated_before: DateTime<Utc>) -> Result<usize> {
        let mut store = self.transactions.write().await;
        let before = store.len();
        store.retain(|_, checkpoint| {
            !(checkpoint.has_finished() && checkpoint.flow.updated_at < updated_before)
        });
        Ok(before - store.len())
    }

    async fn register_timeout_handler(&self, handler: Weak<dyn TransactionTimeoutHandler>) {
        self.sweeper.set_handler(handler).await;
    }

    async fn on_application_start(&self) -> Result<()> {
        self.sweeper
            .start(Arc::new(self.clone()), self.config.clone())
            .await;
        Ok(())
    }

    async fn on_application_shutdown(&self) -> Result<()> {
        self.sweeper.stop().await;
        Ok(())
    }
}
