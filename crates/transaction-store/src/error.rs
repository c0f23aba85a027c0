use common::TransactionId;
use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with transaction storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The stored version did not match the expected version.
    #[error(
        "Concurrency conflict for transaction {workflow_id}/{transaction_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        workflow_id: String,
        transaction_id: TransactionId,
        expected: Version,
        actual: Version,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be mapped back to a checkpoint.
    #[error("Corrupt record for transaction {workflow_id}/{transaction_id}: {reason}")]
    CorruptRecord {
        workflow_id: String,
        transaction_id: String,
        reason: String,
    },
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
