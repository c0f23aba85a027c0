//! Workflow engine error types.

use common::{IdempotencyKeyError, StepAction, TransactionId};
use thiserror::Error;
use transaction_store::{StepState, StorageError};

/// Errors raised by a workflow while driving a transaction.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No transaction is stored under the given id.
    #[error("Transaction not found: {workflow_id}/{transaction_id}")]
    TransactionNotFound {
        workflow_id: String,
        transaction_id: TransactionId,
    },

    /// The workflow has no step with the given id.
    #[error("Step '{step_id}' not found in workflow {workflow_id}")]
    StepNotFound {
        workflow_id: String,
        step_id: String,
    },

    /// A step response arrived for a step that cannot accept it.
    #[error("Step '{step_id}' cannot accept a {action} response in state {state}")]
    InvalidStepState {
        step_id: String,
        action: StepAction,
        state: StepState,
    },

    /// An idempotency key addressed a different workflow.
    #[error("Idempotency key targets workflow {actual}, expected {expected}")]
    KeyMismatch { expected: String, actual: String },

    /// A step address could not be turned into an idempotency key.
    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(#[from] IdempotencyKeyError),

    /// An error occurred in the transaction storage.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
