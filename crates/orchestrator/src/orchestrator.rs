//! The workflow orchestrator service.

use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use common::{IdempotencyKey, IdempotencyKeyError, TransactionId};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use transaction_store::{
    TransactionCheckpoint, TransactionState, TransactionStepError, TransactionStorage,
    TransactionTimeoutHandler,
};
use workflow_engine::{
    ExecutionContext, Workflow, WorkflowError, WorkflowEventHooks, WorkflowRegistry,
    WorkflowResult,
};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::hooks::{FinishedTransaction, OrchestratorHooks};
use crate::notifier::NotificationHub;
use crate::subscribers::{SubscribeOptions, SubscriberId, UnsubscribeOptions};
use crate::transport::PubSubTransport;

/// A workflow addressed by its registered id or directly by handle.
#[derive(Clone)]
pub enum WorkflowRef {
    Id(String),
    Handle(Arc<dyn Workflow>),
}

impl From<&str> for WorkflowRef {
    fn from(id: &str) -> Self {
        Self::Id(id.to_string())
    }
}

impl From<String> for WorkflowRef {
    fn from(id: String) -> Self {
        Self::Id(id)
    }
}

impl From<Arc<dyn Workflow>> for WorkflowRef {
    fn from(workflow: Arc<dyn Workflow>) -> Self {
        Self::Handle(workflow)
    }
}

/// Receipt returned by every operation that drives a transaction.
///
/// It describes the transaction as it stood when the call returned; async
/// steps may still be pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub transaction_id: TransactionId,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_step_idempotency_key: Option<IdempotencyKey>,
    pub has_finished: bool,
    pub has_failed: bool,
    /// False when a cancellation found no running transaction.
    pub exists: bool,
}

/// Outcome of an orchestrator operation.
#[derive(Debug)]
pub struct WorkflowRunResult {
    pub acknowledgement: Acknowledgement,
    pub transaction: Option<TransactionCheckpoint>,
    pub result: Option<Value>,
    pub errors: Vec<TransactionStepError>,
    /// Unexpected workflow error; only returned here when `throw_on_error` is off.
    pub thrown_error: Option<WorkflowError>,
}

impl WorkflowRunResult {
    fn missing(workflow_id: String, transaction_id: TransactionId) -> Self {
        Self {
            acknowledgement: Acknowledgement {
                transaction_id,
                workflow_id,
                parent_step_idempotency_key: None,
                has_finished: false,
                has_failed: false,
                exists: false,
            },
            transaction: None,
            result: None,
            errors: Vec::new(),
            thrown_error: None,
        }
    }
}

/// Options for [`WorkflowOrchestrator::run`].
#[derive(Clone)]
pub struct RunOptions {
    pub input: Value,
    /// Transaction to start or resume; generated when absent.
    pub transaction_id: Option<TransactionId>,
    pub context: ExecutionContext,
    /// Turn step and workflow errors into an `Err` (default: true).
    pub throw_on_error: bool,
    /// Hooks run before the orchestrator's own notification for each event.
    pub events: Option<Arc<dyn WorkflowEventHooks>>,
}

impl RunOptions {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Self::default()
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn WorkflowEventHooks>) -> Self {
        self.events = Some(events);
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            input: Value::Null,
            transaction_id: None,
            context: ExecutionContext::default(),
            throw_on_error: true,
            events: None,
        }
    }
}

/// Options for [`WorkflowOrchestrator::cancel`].
#[derive(Clone)]
pub struct CancelOptions {
    /// Transaction to cancel. Required.
    pub transaction_id: Option<TransactionId>,
    pub context: ExecutionContext,
    pub throw_on_error: bool,
    pub events: Option<Arc<dyn WorkflowEventHooks>>,
}

impl CancelOptions {
    pub fn new(transaction_id: impl Into<TransactionId>) -> Self {
        Self {
            transaction_id: Some(transaction_id.into()),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn WorkflowEventHooks>) -> Self {
        self.events = Some(events);
        self
    }
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            transaction_id: None,
            context: ExecutionContext::default(),
            throw_on_error: true,
            events: None,
        }
    }
}

/// Options for [`WorkflowOrchestrator::set_step_success`] and
/// [`WorkflowOrchestrator::set_step_failure`].
#[derive(Clone)]
pub struct StepResponseOptions {
    pub throw_on_error: bool,
    pub events: Option<Arc<dyn WorkflowEventHooks>>,
}

impl StepResponseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throw_on_error(mut self, throw_on_error: bool) -> Self {
        self.throw_on_error = throw_on_error;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn WorkflowEventHooks>) -> Self {
        self.events = Some(events);
        self
    }
}

impl Default for StepResponseOptions {
    fn default() -> Self {
        Self {
            throw_on_error: true,
            events: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Run,
    Cancel,
    StepResponse,
    Timeout,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Cancel => "cancel",
            Self::StepResponse => "step_response",
            Self::Timeout => "timeout",
        }
    }
}

enum StepOutcome {
    Success(Value),
    Failure(Value),
}

/// Runs workflows, registers the outcome of their async steps and keeps
/// subscribers informed of every transaction lifecycle event.
///
/// When a transaction started as the child of another transaction's step
/// finishes, its outcome is registered on that parent step, which in turn
/// continues the parent transaction.
///
/// ```ignore
/// let orchestrator = WorkflowOrchestrator::new(registry, storage, OrchestratorConfig::from_env());
/// orchestrator.on_application_start().await?;
///
/// let run = orchestrator
///     .run("checkout", RunOptions::new(json!({ "cart_id": "c1" })))
///     .await?;
/// assert!(run.acknowledgement.has_finished);
/// ```
pub struct WorkflowOrchestrator {
    workflows: WorkflowRegistry,
    storage: Arc<dyn TransactionStorage>,
    hub: Arc<NotificationHub>,
    config: OrchestratorConfig,
}

impl WorkflowOrchestrator {
    /// Creates an orchestrator whose notifications stay in this process.
    pub fn new(
        workflows: WorkflowRegistry,
        storage: Arc<dyn TransactionStorage>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let hub = Arc::new(NotificationHub::local(config.clone()));
        Arc::new(Self {
            workflows,
            storage,
            hub,
            config,
        })
    }

    /// Creates an orchestrator that shares notifications with the other
    /// instances connected to `transport`.
    pub fn distributed(
        workflows: WorkflowRegistry,
        storage: Arc<dyn TransactionStorage>,
        transport: Arc<dyn PubSubTransport>,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        let hub = Arc::new(NotificationHub::distributed(config.clone(), transport));
        Arc::new(Self {
            workflows,
            storage,
            hub,
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    pub fn hub(&self) -> &NotificationHub {
        &self.hub
    }

    /// Steps started by this instance that have not settled yet.
    pub fn in_flight_steps(&self) -> usize {
        self.hub.in_flight_steps()
    }

    fn resolve(&self, workflow: WorkflowRef) -> Result<Arc<dyn Workflow>> {
        match workflow {
            WorkflowRef::Handle(workflow) => Ok(workflow),
            WorkflowRef::Id(id) if id.is_empty() => Err(OrchestratorError::MissingWorkflowId),
            WorkflowRef::Id(id) => self
                .workflows
                .get(&id)
                .ok_or(OrchestratorError::WorkflowNotFound(id)),
        }
    }

    /// Starts a transaction of a workflow, or resumes or replays the one
    /// stored under the given transaction id.
    #[tracing::instrument(
        skip_all,
        fields(workflow_id = tracing::field::Empty, transaction_id = tracing::field::Empty)
    )]
    pub async fn run(
        &self,
        workflow: impl Into<WorkflowRef>,
        options: RunOptions,
    ) -> Result<WorkflowRunResult> {
        let workflow = self.resolve(workflow.into())?;
        let RunOptions {
            input,
            transaction_id,
            mut context,
            throw_on_error,
            events,
        } = options;

        let transaction_id = transaction_id
            .or_else(|| context.transaction_id.take())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(TransactionId::generate);
        context.transaction_id = Some(transaction_id.clone());

        let span = tracing::Span::current();
        span.record("workflow_id", workflow.id());
        span.record("transaction_id", transaction_id.as_str());

        let started = Instant::now();
        let hooks = OrchestratorHooks::new(Arc::clone(&self.hub), events);
        let outcome = workflow.run(input, context, &hooks).await;
        let result = self
            .complete(
                workflow.id(),
                transaction_id,
                outcome,
                &hooks,
                Operation::Run,
                throw_on_error,
            )
            .await;

        metrics::histogram!(
            "orchestrator_run_duration_seconds",
            "workflow_id" => workflow.id().to_string()
        )
        .record(started.elapsed().as_secs_f64());
        result
    }

    /// Rolls back a running transaction.
    ///
    /// A missing transaction yields an acknowledgement with `exists: false`
    /// when `throw_on_error` is off, and an error otherwise.
    #[tracing::instrument(
        skip_all,
        fields(workflow_id = tracing::field::Empty, transaction_id = tracing::field::Empty)
    )]
    pub async fn cancel(
        &self,
        workflow: impl Into<WorkflowRef>,
        options: CancelOptions,
    ) -> Result<WorkflowRunResult> {
        let workflow = workflow.into();
        if matches!(&workflow, WorkflowRef::Id(id) if id.is_empty()) {
            return Err(OrchestratorError::MissingWorkflowId);
        }
        let CancelOptions {
            transaction_id,
            context,
            throw_on_error,
            events,
        } = options;
        let transaction_id = transaction_id
            .filter(|id| !id.is_empty())
            .ok_or(OrchestratorError::MissingTransactionId)?;

        let workflow = match self.resolve(workflow) {
            Ok(workflow) => workflow,
            Err(OrchestratorError::WorkflowNotFound(id)) if !throw_on_error => {
                return Ok(WorkflowRunResult::missing(id, transaction_id));
            }
            Err(e) => return Err(e),
        };

        let span = tracing::Span::current();
        span.record("workflow_id", workflow.id());
        span.record("transaction_id", transaction_id.as_str());

        let context = context
            .with_transaction_id(transaction_id.clone())
            .cancelling();
        let Some(transaction) = workflow
            .get_running_transaction(&transaction_id, &context)
            .await?
        else {
            if throw_on_error {
                return Err(OrchestratorError::TransactionNotFound {
                    workflow_id: workflow.id().to_string(),
                    transaction_id,
                });
            }
            debug!("no running transaction to cancel");
            return Ok(WorkflowRunResult::missing(
                workflow.id().to_string(),
                transaction_id,
            ));
        };

        let hooks = OrchestratorHooks::new(Arc::clone(&self.hub), events);
        let outcome = workflow.cancel(transaction, &hooks).await;
        self.complete(
            workflow.id(),
            transaction_id,
            outcome,
            &hooks,
            Operation::Cancel,
            throw_on_error,
        )
        .await
    }

    /// Loads a transaction without changing it.
    #[tracing::instrument(skip(self, context))]
    pub async fn get_running_transaction(
        &self,
        workflow_id: &str,
        transaction_id: &TransactionId,
        context: ExecutionContext,
    ) -> Result<Option<TransactionCheckpoint>> {
        if workflow_id.is_empty() {
            return Err(OrchestratorError::MissingWorkflowId);
        }
        if transaction_id.is_empty() {
            return Err(OrchestratorError::MissingTransactionId);
        }

        let workflow = self.resolve(WorkflowRef::Id(workflow_id.to_string()))?;
        let context = context.with_transaction_id(transaction_id.clone());
        Ok(workflow
            .get_running_transaction(transaction_id, &context)
            .await?)
    }

    /// Completes the awaited step addressed by the idempotency key, given
    /// either decoded or as its encoded string.
    #[tracing::instrument(skip_all)]
    pub async fn set_step_success<K>(
        &self,
        idempotency_key: K,
        response: Value,
        options: StepResponseOptions,
    ) -> Result<WorkflowRunResult>
    where
        K: TryInto<IdempotencyKey>,
        IdempotencyKeyError: From<K::Error>,
    {
        let key: IdempotencyKey = idempotency_key
            .try_into()
            .map_err(IdempotencyKeyError::from)?;
        self.respond(key, StepOutcome::Success(response), options)
            .await
    }

    /// Fails the awaited step addressed by the idempotency key and rolls
    /// its transaction back.
    #[tracing::instrument(skip_all)]
    pub async fn set_step_failure<K>(
        &self,
        idempotency_key: K,
        error: Value,
        options: StepResponseOptions,
    ) -> Result<WorkflowRunResult>
    where
        K: TryInto<IdempotencyKey>,
        IdempotencyKeyError: From<K::Error>,
    {
        let key: IdempotencyKey = idempotency_key
            .try_into()
            .map_err(IdempotencyKeyError::from)?;
        self.respond(key, StepOutcome::Failure(error), options)
            .await
    }

    // Boxed: parent propagation re-enters here from `complete`.
    fn respond(
        &self,
        key: IdempotencyKey,
        outcome: StepOutcome,
        options: StepResponseOptions,
    ) -> BoxFuture<'_, Result<WorkflowRunResult>> {
        async move {
            let workflow = self.resolve(WorkflowRef::Id(key.workflow_id().to_string()))?;
            debug!(idempotency_key = %key, "registering step response");

            let hooks = OrchestratorHooks::new(Arc::clone(&self.hub), options.events);
            let result = match outcome {
                StepOutcome::Success(response) => {
                    workflow
                        .register_step_success(&key, response, &hooks)
                        .await
                }
                StepOutcome::Failure(error) => {
                    workflow.register_step_failure(&key, error, &hooks).await
                }
            };

            self.complete(
                workflow.id(),
                key.transaction_id().clone(),
                result,
                &hooks,
                Operation::StepResponse,
                options.throw_on_error,
            )
            .await
        }
        .boxed()
    }

    /// Rolls back a transaction that passed its deadline.
    #[tracing::instrument(skip(self))]
    pub async fn timeout(
        &self,
        workflow_id: &str,
        transaction_id: &TransactionId,
    ) -> Result<WorkflowRunResult> {
        let workflow = self.resolve(WorkflowRef::Id(workflow_id.to_string()))?;
        let hooks = OrchestratorHooks::new(Arc::clone(&self.hub), None);
        let outcome = workflow.timeout(transaction_id, &hooks).await;
        self.complete(
            workflow.id(),
            transaction_id.clone(),
            outcome,
            &hooks,
            Operation::Timeout,
            false,
        )
        .await
    }

    /// Shared tail of every operation: acknowledge, propagate a finished
    /// transaction to its parent step, emit the held-back finish event and
    /// finally decide whether the caller gets an error.
    async fn complete(
        &self,
        workflow_id: &str,
        transaction_id: TransactionId,
        outcome: WorkflowResult,
        hooks: &OrchestratorHooks,
        operation: Operation,
        throw_on_error: bool,
    ) -> Result<WorkflowRunResult> {
        let WorkflowResult {
            transaction,
            result,
            errors,
            thrown_error,
        } = outcome;

        let state = transaction.as_ref().map(TransactionCheckpoint::state);
        let has_failed = match operation {
            // A cancellation that reverted everything succeeded.
            Operation::Cancel => state == Some(TransactionState::Failed),
            _ => is_failure(state),
        };
        let acknowledgement = Acknowledgement {
            transaction_id,
            workflow_id: workflow_id.to_string(),
            parent_step_idempotency_key: transaction
                .as_ref()
                .and_then(|t| t.flow.metadata.parent_step_idempotency_key.clone()),
            has_finished: state.is_some_and(|s| s.is_finished()),
            has_failed,
            exists: true,
        };

        if let Some(finished) = hooks.take_finished().await {
            if let Some(parent) = &acknowledgement.parent_step_idempotency_key {
                self.trigger_parent_step(parent, &finished).await;
            }
            hooks.emit_finish(finished).await;
        }

        let status = if thrown_error.is_some() {
            "error"
        } else if acknowledgement.has_failed {
            "failed"
        } else if acknowledgement.has_finished {
            "finished"
        } else {
            "pending"
        };
        metrics::counter!(
            "orchestrator_runs_total",
            "operation" => operation.as_str(),
            "status" => status
        )
        .increment(1);
        info!(
            workflow_id,
            transaction_id = %acknowledgement.transaction_id,
            operation = operation.as_str(),
            status,
            "workflow operation completed"
        );

        if throw_on_error {
            if let Some(error) = thrown_error {
                return Err(error.into());
            }
            if let Some(error) = errors.first() {
                return Err(OrchestratorError::Step(error.clone()));
            }
        }

        Ok(WorkflowRunResult {
            acknowledgement,
            transaction,
            result,
            errors,
            thrown_error,
        })
    }

    /// Registers a finished child transaction's outcome on the parent step
    /// waiting for it.
    async fn trigger_parent_step(&self, parent: &IdempotencyKey, finished: &FinishedTransaction) {
        let child = &finished.transaction;
        let outcome = if is_failure(Some(child.state())) {
            let message = finished
                .errors
                .first()
                .map(TransactionStepError::message)
                .unwrap_or_else(|| {
                    format!("transaction {} ended {}", child.transaction_id(), child.state())
                });
            let errors = serde_json::to_value(&finished.errors).unwrap_or_default();
            StepOutcome::Failure(json!({ "message": message, "errors": errors }))
        } else {
            StepOutcome::Success(finished.result.clone().unwrap_or(Value::Null))
        };

        let options = StepResponseOptions::new().throw_on_error(false);
        match self.respond(parent.clone(), outcome, options).await {
            Ok(response) => match response.thrown_error {
                Some(error) => warn!(
                    parent = %parent,
                    error = %error,
                    "parent step rejected child outcome"
                ),
                None => info!(
                    parent = %parent,
                    child = %child.transaction_id(),
                    "propagated outcome to parent step"
                ),
            },
            Err(error) => warn!(
                parent = %parent,
                error = %error,
                "failed to propagate outcome to parent step"
            ),
        }
    }

    /// Registers a subscriber for a workflow's notifications.
    pub async fn subscribe(&self, options: SubscribeOptions) -> Result<SubscriberId> {
        if options.workflow_id.is_empty() {
            return Err(OrchestratorError::MissingWorkflowId);
        }
        Ok(self.hub.subscribe(options).await?)
    }

    /// Removes a subscriber. Returns true if one was removed.
    pub async fn unsubscribe(&self, options: UnsubscribeOptions) -> Result<bool> {
        if options.workflow_id.is_empty() {
            return Err(OrchestratorError::MissingWorkflowId);
        }
        Ok(self.hub.unsubscribe(options).await?)
    }

    /// Registers with the storage for timeout callbacks, then starts the
    /// storage's background work and the notification transport.
    pub async fn on_application_start(self: &Arc<Self>) -> Result<()> {
        let strong: Arc<dyn TransactionTimeoutHandler> = self.clone();
        let handler: Weak<dyn TransactionTimeoutHandler> = Arc::downgrade(&strong);
        self.storage.register_timeout_handler(handler).await;
        self.storage.on_application_start().await?;
        self.hub.start().await?;
        info!(instance_id = %self.config.instance_id, "orchestrator started");
        Ok(())
    }

    /// Waits for in-flight steps to settle before the storage prepares
    /// for shutdown.
    pub async fn on_application_prepare_shutdown(&self) -> Result<()> {
        self.hub.drain().await;
        self.storage.on_application_prepare_shutdown().await?;
        Ok(())
    }

    pub async fn on_application_shutdown(&self) -> Result<()> {
        self.hub.stop().await?;
        self.storage.on_application_shutdown().await?;
        info!(instance_id = %self.config.instance_id, "orchestrator stopped");
        Ok(())
    }
}

fn is_failure(state: Option<TransactionState>) -> bool {
    matches!(
        state,
        Some(TransactionState::Reverted | TransactionState::Failed)
    )
}

#[async_trait]
impl TransactionTimeoutHandler for WorkflowOrchestrator {
    async fn on_transaction_timeout(&self, workflow_id: &str, transaction_id: &TransactionId) {
        if let Err(e) = self.timeout(workflow_id, transaction_id).await {
            warn!(workflow_id, transaction_id = %transaction_id, error = %e, "failed to time out transaction");
        }
    }
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("workflows", &self.workflows)
            .field("instance_id", &self.config.instance_id)
            .field("distributed", &self.hub.is_distributed())
            .finish()
    }
}
