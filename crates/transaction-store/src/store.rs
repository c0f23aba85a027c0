use std::sync::Weak;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::TransactionId;

use crate::{Result, TransactionCheckpoint, TransactionQuery, Version};

/// Options for saving a checkpoint.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Version the stored copy must currently be at.
    /// If None, no version check is performed (use with caution).
    pub expected_version: Option<Version>,
}

impl SaveOptions {
    /// Creates options with no version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the stored copy to be at a specific version.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Creates options expecting the transaction not to be stored yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Receives callbacks from a storage adapter about transactions it found
/// expired while sweeping, so that they can be resumed by the owner of the
/// workflow definitions.
#[async_trait]
pub trait TransactionTimeoutHandler: Send + Sync {
    /// Called once per sweep for every unfinished transaction past its deadline.
    async fn on_transaction_timeout(&self, workflow_id: &str, transaction_id: &TransactionId);
}

/// Persistence of transaction checkpoints keyed by workflow and transaction id.
///
/// All implementations must be thread-safe (Send + Sync). Cross-process
/// coordination is expressed through versioned saves: a save fails with
/// `ConcurrencyConflict` when the stored version differs from the expected one.
#[async_trait]
pub trait TransactionStorage: Send + Sync {
    /// Loads the checkpoint of a transaction, if stored.
    async fn get(
        &self,
        workflow_id: &str,
        transaction_id: &TransactionId,
    ) -> Result<Option<TransactionCheckpoint>>;

    /// Persists a checkpoint and returns the new stored version.
    async fn save(
        &self,
        checkpoint: &TransactionCheckpoint,
        options: SaveOptions,
    ) -> Result<Version>;

    /// Scans stored checkpoints.
    ///
    /// Results are ordered by creation time (oldest first).
    async fn list(&self, query: TransactionQuery) -> Result<Vec<TransactionCheckpoint>>;

    /// Removes a checkpoint. Returns true if one was removed.
    async fn delete(&self, workflow_id: &str, transaction_id: &TransactionId) -> Result<bool>;

    /// Removes finished checkpoints last updated before the given instant.
    async fn purge_finished(&self, updated_before: DateTime<Utc>) -> Result<usize>;

    /// Registers the component that resumes expired transactions.
    async fn register_timeout_handler(&self, _handler: Weak<dyn TransactionTimeoutHandler>) {}

    /// Starts background work such as sweeping for expired transactions.
    async fn on_application_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called before shutdown while in-flight work is still draining.
    async fn on_application_prepare_shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Stops background work.
    async fn on_application_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Extension trait providing convenience methods for transaction storage.
#[async_trait]
pub trait TransactionStorageExt: TransactionStorage {
    /// Saves a checkpoint that must not exist yet and bumps its version in place.
    async fn insert(&self, checkpoint: &mut TransactionCheckpoint) -> Result<Version> {
        let version = self.save(checkpoint, SaveOptions::expect_new()).await?;
        checkpoint.version = version;
        Ok(version)
    }

    /// Saves a checkpoint against the version it was read at and bumps it in place.
    async fn update(&self, checkpoint: &mut TransactionCheckpoint) -> Result<Version> {
        let version = self
            .save(checkpoint, SaveOptions::expect_version(checkpoint.version))
            .await?;
        checkpoint.version = version;
        Ok(version)
    }

    /// Checks whether a transaction is stored.
    async fn exists(&self, workflow_id: &str, transaction_id: &TransactionId) -> Result<bool> {
        Ok(self.get(workflow_id, transaction_id).await?.is_some())
    }
}

// Blanket implementation for all TransactionStorage implementations
impl<T: TransactionStorage + ?Sized> TransactionStorageExt for T {}
