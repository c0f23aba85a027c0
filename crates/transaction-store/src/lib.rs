//! Durable checkpoints for workflow transactions.
//!
//! A checkpoint captures the flow of a transaction (states of the transaction
//! and of each step), the data produced by its steps and the errors raised
//! along the way. Storage adapters persist checkpoints with optimistic
//! concurrency and sweep for transactions past their deadline.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod store;
pub mod sweeper;

pub use checkpoint::{
    FlowMetadata, PendingOutcome, StepState, TransactionCheckpoint, TransactionContext, TransactionFlow,
    TransactionState, TransactionStep, TransactionStepError, Version,
};
pub use common::{IdempotencyKey, StepAction, TransactionId};
pub use config::{MIN_SWEEP_INTERVAL, StorageConfig};
pub use error::{Result, StorageError};
pub use memory::InMemoryTransactionStorage;
pub use postgres::PostgresTransactionStorage;
pub use query::TransactionQuery;
pub use store::{SaveOptions, TransactionStorage, TransactionStorageExt, TransactionTimeoutHandler};
pub use sweeper::{SweepReport, TimeoutSweeper};
