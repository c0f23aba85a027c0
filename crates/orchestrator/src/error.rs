//! Orchestrator error types.

use common::{IdempotencyKeyError, TransactionId};
use thiserror::Error;
use transaction_store::{StorageError, TransactionStepError};
use workflow_engine::WorkflowError;

use crate::transport::TransportError;

/// Errors surfaced by [`WorkflowOrchestrator`](crate::WorkflowOrchestrator) operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// An operation was called without a workflow id.
    #[error("Workflow id is required")]
    MissingWorkflowId,

    /// An operation that targets an existing run was called without a transaction id.
    #[error("Transaction id is required")]
    MissingTransactionId,

    /// No workflow is registered under the given id.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// No running transaction matches the given id.
    #[error("Transaction not found: {workflow_id}/{transaction_id}")]
    TransactionNotFound {
        workflow_id: String,
        transaction_id: TransactionId,
    },

    /// The workflow raised an error while driving the transaction.
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// A step of the transaction failed.
    #[error("Step failed: {0}")]
    Step(TransactionStepError),

    /// An idempotency key could not be decoded.
    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(#[from] IdempotencyKeyError),

    /// The pub/sub transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The transaction storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl OrchestratorError {
    /// Returns true for errors raised because required input was missing.
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::MissingWorkflowId | Self::MissingTransactionId)
    }

    /// Returns true for errors raised because a lookup found nothing.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::WorkflowNotFound(_) | Self::TransactionNotFound { .. }
        )
    }
}

/// Convenience type alias for orchestrator results.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
