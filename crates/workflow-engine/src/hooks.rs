//! Lifecycle hooks emitted while a transaction executes.

use async_trait::async_trait;
use serde_json::Value;
use transaction_store::{TransactionCheckpoint, TransactionStep, TransactionStepError};

/// Receives the lifecycle events of a transaction, one method per hook.
///
/// Hooks are awaited in the order the engine emits them, after the state
/// they describe has been checkpointed. All methods default to no-ops.
#[async_trait]
pub trait WorkflowEventHooks: Send + Sync {
    /// A new transaction started.
    async fn on_begin(&self, _transaction: &TransactionCheckpoint) {}

    /// An unfinished transaction was picked up again.
    async fn on_resume(&self, _transaction: &TransactionCheckpoint) {}

    /// The transaction passed its deadline and is being rolled back.
    async fn on_timeout(&self, _transaction: &TransactionCheckpoint) {}

    async fn on_step_begin(&self, _transaction: &TransactionCheckpoint, _step: &TransactionStep) {}

    async fn on_step_success(&self, _transaction: &TransactionCheckpoint, _step: &TransactionStep) {
    }

    async fn on_step_failure(&self, _transaction: &TransactionCheckpoint, _step: &TransactionStep) {
    }

    /// An async step was invoked and now waits for its outcome.
    async fn on_step_awaiting(&self, _transaction: &TransactionCheckpoint, _step: &TransactionStep) {
    }

    async fn on_compensate_begin(&self, _transaction: &TransactionCheckpoint) {}

    async fn on_compensate_step_success(
        &self,
        _transaction: &TransactionCheckpoint,
        _step: &TransactionStep,
    ) {
    }

    async fn on_compensate_step_failure(
        &self,
        _transaction: &TransactionCheckpoint,
        _step: &TransactionStep,
    ) {
    }

    /// The transaction reached a terminal state. Emitted once per transaction.
    async fn on_finish(
        &self,
        _transaction: &TransactionCheckpoint,
        _result: Option<&Value>,
        _errors: &[TransactionStepError],
    ) {
    }
}

/// Hooks that ignore every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl WorkflowEventHooks for NoopHooks {}
