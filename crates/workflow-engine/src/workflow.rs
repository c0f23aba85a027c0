//! The contract between a workflow definition and whoever drives it.

use async_trait::async_trait;
use common::{IdempotencyKey, TransactionId};
use serde_json::Value;
use transaction_store::{TransactionCheckpoint, TransactionStepError};

use crate::error::{Result, WorkflowError};
use crate::hooks::WorkflowEventHooks;

/// Per-call execution context handed to a workflow.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Transaction to run or resume. A new id is generated when absent.
    pub transaction_id: Option<TransactionId>,
    /// Step of an enclosing transaction waiting for this one to finish.
    pub parent_step_idempotency_key: Option<IdempotencyKey>,
    /// Correlates the events of related transactions.
    pub event_group_id: Option<String>,
    /// Set when the lookup happens on behalf of a cancellation.
    pub is_cancelling: bool,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_parent_step(mut self, key: IdempotencyKey) -> Self {
        self.parent_step_idempotency_key = Some(key);
        self
    }

    pub fn with_event_group_id(mut self, event_group_id: impl Into<String>) -> Self {
        self.event_group_id = Some(event_group_id.into());
        self
    }

    pub fn cancelling(mut self) -> Self {
        self.is_cancelling = true;
        self
    }
}

/// Outcome of driving a transaction.
///
/// Workflows never fail their callers directly: step errors are collected in
/// `errors` and unexpected failures are reported in `thrown_error`, so the
/// caller can finish its own bookkeeping before deciding what to surface.
#[derive(Debug, Default)]
pub struct WorkflowResult {
    pub transaction: Option<TransactionCheckpoint>,
    /// Response of the last step once the transaction is done.
    pub result: Option<Value>,
    pub errors: Vec<TransactionStepError>,
    pub thrown_error: Option<WorkflowError>,
}

impl WorkflowResult {
    /// Builds a result from the current state of a transaction.
    pub fn from_transaction(transaction: TransactionCheckpoint) -> Self {
        let result = final_response(&transaction);
        Self {
            errors: transaction.errors.clone(),
            result,
            transaction: Some(transaction),
            thrown_error: None,
        }
    }

    /// Builds a result for a call that failed before or while driving the transaction.
    pub fn thrown(error: WorkflowError, transaction: Option<TransactionCheckpoint>) -> Self {
        Self {
            errors: transaction
                .as_ref()
                .map(|t| t.errors.clone())
                .unwrap_or_default(),
            transaction,
            result: None,
            thrown_error: Some(error),
        }
    }

    pub fn has_finished(&self) -> bool {
        self.transaction
            .as_ref()
            .is_some_and(TransactionCheckpoint::has_finished)
    }
}

/// Response of the last step, available once every step is done.
pub fn final_response(transaction: &TransactionCheckpoint) -> Option<Value> {
    if transaction.state() != transaction_store::TransactionState::Done {
        return None;
    }
    transaction
        .flow
        .steps
        .last()
        .and_then(|step| transaction.context.invoke.get(&step.id))
        .cloned()
}

/// A named, durable, compensable sequence of steps.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Identifier the workflow is registered under.
    fn id(&self) -> &str;

    /// Starts a transaction, resumes an unfinished one, or replays a finished one.
    async fn run(
        &self,
        input: Value,
        context: ExecutionContext,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult;

    /// Rolls back a running transaction previously loaded through
    /// [`Workflow::get_running_transaction`].
    async fn cancel(
        &self,
        transaction: TransactionCheckpoint,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult;

    /// Completes the awaited step addressed by `key` and continues the transaction.
    async fn register_step_success(
        &self,
        key: &IdempotencyKey,
        response: Value,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult;

    /// Fails the awaited step addressed by `key` and rolls the transaction back.
    async fn register_step_failure(
        &self,
        key: &IdempotencyKey,
        error: Value,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult;

    /// Loads a transaction without changing its stored state.
    async fn get_running_transaction(
        &self,
        transaction_id: &TransactionId,
        context: &ExecutionContext,
    ) -> Result<Option<TransactionCheckpoint>>;

    /// Rolls back a transaction that passed its deadline.
    async fn timeout(
        &self,
        transaction_id: &TransactionId,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult;
}
