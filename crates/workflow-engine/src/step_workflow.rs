//! A sequential step engine backed by [`TransactionStorage`].
//!
//! Steps run in declaration order. Every state change is checkpointed before
//! the matching hook is emitted, so a transaction can be resumed from storage
//! by any process after a crash. When a step fails, is cancelled or times out,
//! the completed steps are compensated in reverse order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{IdempotencyKey, StepAction, TransactionId};
use serde_json::Value;
use transaction_store::{
    PendingOutcome, StepState, StorageError, TransactionCheckpoint, TransactionContext,
    TransactionFlow, TransactionState, TransactionStep, TransactionStepError, TransactionStorage,
    TransactionStorageExt,
};

use crate::error::{Result, WorkflowError};
use crate::hooks::WorkflowEventHooks;
use crate::step::{StepDefinition, StepInput};
use crate::workflow::{ExecutionContext, Workflow, WorkflowResult, final_response};

/// Reloads after a version conflict before giving up.
const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RollbackCause {
    Failure,
    Cancel,
    Timeout,
}

impl RollbackCause {
    /// Recovers the cause of a compensation that was interrupted.
    fn of(transaction: &TransactionCheckpoint) -> Self {
        if transaction.flow.cancelled_at.is_some() {
            Self::Cancel
        } else if transaction.flow.timed_out {
            Self::Timeout
        } else {
            Self::Failure
        }
    }
}

/// How a registered outcome was taken in.
enum Accepted {
    /// The step is awaiting; apply the outcome now.
    Awaiting(usize),
    /// The step's invoke handler is still running; hold the outcome.
    Running(usize),
    /// Duplicate or late response.
    Ignored,
}

/// Where an async step stands once its invoke handler has returned.
enum Settled {
    Awaiting,
    Outcome(PendingOutcome),
    /// The transaction moved on while the handler ran (e.g. it was cancelled).
    Superseded,
}

fn is_conflict(error: &WorkflowError) -> bool {
    matches!(
        error,
        WorkflowError::Storage(StorageError::ConcurrencyConflict { .. })
    )
}

/// Builder for [`StepWorkflow`].
pub struct StepWorkflowBuilder {
    id: String,
    steps: Vec<StepDefinition>,
    timeout: Option<Duration>,
}

impl StepWorkflowBuilder {
    /// Appends a step. Step ids must be unique within the workflow.
    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Rolls transactions back once they run longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self, storage: Arc<dyn TransactionStorage>) -> StepWorkflow {
        StepWorkflow {
            id: self.id,
            steps: self.steps,
            timeout: self.timeout,
            storage,
        }
    }
}

/// Runs an ordered list of steps as a durable, compensable transaction.
pub struct StepWorkflow {
    id: String,
    steps: Vec<StepDefinition>,
    timeout: Option<Duration>,
    storage: Arc<dyn TransactionStorage>,
}

impl StepWorkflow {
    pub fn builder(id: impl Into<String>) -> StepWorkflowBuilder {
        StepWorkflowBuilder {
            id: id.into(),
            steps: Vec::new(),
            timeout: None,
        }
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn storage(&self) -> &Arc<dyn TransactionStorage> {
        &self.storage
    }

    fn definition(&self, step_id: &str) -> Result<&StepDefinition> {
        self.steps
            .iter()
            .find(|step| step.id() == step_id)
            .ok_or_else(|| WorkflowError::StepNotFound {
                workflow_id: self.id.clone(),
                step_id: step_id.to_string(),
            })
    }

    fn new_checkpoint(
        &self,
        transaction_id: TransactionId,
        input: Value,
        context: &ExecutionContext,
    ) -> TransactionCheckpoint {
        let steps = self
            .steps
            .iter()
            .map(|s| TransactionStep::new(s.id(), s.is_async(), s.has_compensation()))
            .collect();

        let mut flow = TransactionFlow::new(&self.id, transaction_id, steps);
        flow.metadata.parent_step_idempotency_key = context.parent_step_idempotency_key.clone();
        flow.metadata.event_group_id = context.event_group_id.clone();
        if let Some(timeout) = self.timeout
            && let Ok(timeout) = chrono::Duration::from_std(timeout)
        {
            flow.timeout_at = Some(flow.created_at + timeout);
        }

        TransactionCheckpoint::new(flow, TransactionContext::new(input))
    }

    fn step_input(
        &self,
        transaction: &TransactionCheckpoint,
        step_id: &str,
        action: StepAction,
        response: Option<Value>,
    ) -> Result<StepInput> {
        Ok(StepInput {
            workflow_id: self.id.clone(),
            transaction_id: transaction.transaction_id().clone(),
            step_id: step_id.to_string(),
            idempotency_key: IdempotencyKey::new(
                self.id.as_str(),
                transaction.transaction_id().clone(),
                step_id,
                action,
            )?,
            payload: transaction.context.payload.clone(),
            responses: transaction.context.invoke.clone(),
            response,
        })
    }

    async fn checkpoint(&self, transaction: &mut TransactionCheckpoint) -> Result<()> {
        self.storage.update(transaction).await?;
        Ok(())
    }

    fn outcome(transaction: TransactionCheckpoint, outcome: Result<()>) -> WorkflowResult {
        match outcome {
            Ok(()) => WorkflowResult::from_transaction(transaction),
            Err(e) => {
                tracing::error!(
                    workflow_id = %transaction.workflow_id(),
                    transaction_id = %transaction.transaction_id(),
                    error = %e,
                    "transaction interrupted"
                );
                WorkflowResult::thrown(e, Some(transaction))
            }
        }
    }

    /// Continues an unfinished transaction from wherever it stopped.
    async fn resume(
        &self,
        transaction: &mut TransactionCheckpoint,
        hooks: &dyn WorkflowEventHooks,
    ) -> Result<()> {
        match transaction.state() {
            TransactionState::Compensating => {
                let cause = RollbackCause::of(transaction);
                self.rollback(transaction, cause, hooks).await
            }
            TransactionState::NotStarted => {
                transaction.flow.state = TransactionState::Invoking;
                self.checkpoint(transaction).await?;
                self.advance(transaction, hooks).await
            }
            _ => self.advance(transaction, hooks).await,
        }
    }

    /// Invokes the pending steps in order until one awaits, fails, or all are done.
    async fn advance(
        &self,
        transaction: &mut TransactionCheckpoint,
        hooks: &dyn WorkflowEventHooks,
    ) -> Result<()> {
        for index in 0..transaction.flow.steps.len() {
            match transaction.flow.steps[index].state {
                StepState::Done | StepState::Skipped => continue,
                StepState::NotStarted => {}
                // Waiting for an outcome, or already being invoked.
                _ => return Ok(()),
            }

            let step_id = transaction.flow.steps[index].id.clone();
            let definition = self.definition(&step_id)?;

            let step = &mut transaction.flow.steps[index];
            step.state = StepState::Invoking;
            step.attempts += 1;
            step.started_at = Some(Utc::now());
            self.checkpoint(transaction).await?;
            hooks
                .on_step_begin(transaction, &transaction.flow.steps[index])
                .await;

            tracing::debug!(workflow_id = %self.id, %step_id, "invoking step");
            let input = self.step_input(transaction, &step_id, StepAction::Invoke, None)?;
            match definition.run_invoke(input).await {
                Ok(_) if definition.is_async() => match self.settle(transaction, index).await? {
                    Settled::Awaiting => {
                        hooks
                            .on_step_awaiting(transaction, &transaction.flow.steps[index])
                            .await;
                        return Ok(());
                    }
                    Settled::Outcome(PendingOutcome::Success(response)) => {
                        self.complete_step(transaction, index, response, hooks)
                            .await?;
                    }
                    Settled::Outcome(PendingOutcome::Failure(error)) => {
                        self.fail_step(transaction, index, error, hooks).await?;
                        return self
                            .rollback(transaction, RollbackCause::Failure, hooks)
                            .await;
                    }
                    Settled::Superseded => return Ok(()),
                },
                Ok(response) => {
                    self.complete_step(transaction, index, response, hooks)
                        .await?;
                }
                Err(failure) => {
                    self.fail_step(transaction, index, failure.error, hooks)
                        .await?;
                    return self
                        .rollback(transaction, RollbackCause::Failure, hooks)
                        .await;
                }
            }
        }

        transaction.flow.state = TransactionState::Done;
        self.finish(transaction, hooks).await
    }

    /// Moves an async step out of `Invoking` once its handler has returned,
    /// taking over an outcome registered while the handler ran.
    async fn settle(
        &self,
        transaction: &mut TransactionCheckpoint,
        index: usize,
    ) -> Result<Settled> {
        let mut attempt = 0;
        loop {
            if let Some(latest) = self
                .storage
                .get(&self.id, transaction.transaction_id())
                .await?
            {
                *transaction = latest;
            }

            if transaction.flow.state != TransactionState::Invoking {
                return Ok(Settled::Superseded);
            }
            let step = &mut transaction.flow.steps[index];
            if step.state != StepState::Invoking {
                return Ok(Settled::Superseded);
            }
            if let Some(outcome) = step.pending_outcome.take() {
                tracing::debug!(workflow_id = %self.id, step_id = %step.id, "applying held outcome");
                return Ok(Settled::Outcome(outcome));
            }

            step.state = StepState::Awaiting;
            match self.checkpoint(transaction).await {
                Ok(()) => return Ok(Settled::Awaiting),
                Err(e) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    async fn complete_step(
        &self,
        transaction: &mut TransactionCheckpoint,
        index: usize,
        response: Value,
        hooks: &dyn WorkflowEventHooks,
    ) -> Result<()> {
        let step = &mut transaction.flow.steps[index];
        step.state = StepState::Done;
        step.completed_at = Some(Utc::now());
        let step_id = step.id.clone();
        transaction.context.invoke.insert(step_id, response);

        self.checkpoint(transaction).await?;
        hooks
            .on_step_success(transaction, &transaction.flow.steps[index])
            .await;
        Ok(())
    }

    async fn fail_step(
        &self,
        transaction: &mut TransactionCheckpoint,
        index: usize,
        error: Value,
        hooks: &dyn WorkflowEventHooks,
    ) -> Result<()> {
        let step = &mut transaction.flow.steps[index];
        step.state = StepState::Failed;
        step.completed_at = Some(Utc::now());
        let step_id = step.id.clone();

        tracing::warn!(workflow_id = %self.id, %step_id, "step failed");
        transaction
            .errors
            .push(TransactionStepError::new(step_id, StepAction::Invoke, error));

        self.checkpoint(transaction).await?;
        hooks
            .on_step_failure(transaction, &transaction.flow.steps[index])
            .await;
        Ok(())
    }

    /// Compensates completed steps in reverse order and finishes the transaction.
    async fn rollback(
        &self,
        transaction: &mut TransactionCheckpoint,
        cause: RollbackCause,
        hooks: &dyn WorkflowEventHooks,
    ) -> Result<()> {
        let cause = if transaction.state() == TransactionState::Compensating {
            RollbackCause::of(transaction)
        } else {
            transaction.flow.state = TransactionState::Compensating;
            match cause {
                RollbackCause::Cancel => transaction.flow.cancelled_at = Some(Utc::now()),
                RollbackCause::Timeout => transaction.flow.timed_out = true,
                RollbackCause::Failure => {}
            }
            self.checkpoint(transaction).await?;
            hooks.on_compensate_begin(transaction).await;
            cause
        };

        for index in (0..transaction.flow.steps.len()).rev() {
            match transaction.flow.steps[index].state {
                StepState::Done | StepState::Compensating => {}
                StepState::NotStarted | StepState::Invoking | StepState::Awaiting => {
                    transaction.flow.steps[index].state = StepState::Skipped;
                    continue;
                }
                _ => continue,
            }

            let step_id = transaction.flow.steps[index].id.clone();
            let definition = self.definition(&step_id)?;
            if !definition.has_compensation() {
                continue;
            }

            transaction.flow.steps[index].state = StepState::Compensating;
            self.checkpoint(transaction).await?;

            tracing::debug!(workflow_id = %self.id, %step_id, "compensating step");
            let response = transaction.context.invoke.get(&step_id).cloned();
            let input = self.step_input(transaction, &step_id, StepAction::Compensate, response)?;
            match definition.run_compensate(input).await {
                Some(Ok(value)) => {
                    let step = &mut transaction.flow.steps[index];
                    step.state = StepState::Reverted;
                    step.completed_at = Some(Utc::now());
                    transaction.context.compensate.insert(step_id, value);

                    self.checkpoint(transaction).await?;
                    hooks
                        .on_compensate_step_success(transaction, &transaction.flow.steps[index])
                        .await;
                }
                Some(Err(failure)) => {
                    let step = &mut transaction.flow.steps[index];
                    step.state = StepState::CompensationFailed;
                    step.completed_at = Some(Utc::now());

                    tracing::warn!(workflow_id = %self.id, %step_id, "compensation failed");
                    transaction.errors.push(TransactionStepError::new(
                        step_id,
                        StepAction::Compensate,
                        failure.error,
                    ));

                    self.checkpoint(transaction).await?;
                    hooks
                        .on_compensate_step_failure(transaction, &transaction.flow.steps[index])
                        .await;
                }
                None => {}
            }
        }

        let steps = &transaction.flow.steps;
        let compensation_failed = steps
            .iter()
            .any(|s| s.state == StepState::CompensationFailed);
        let reverted = steps.iter().any(|s| s.state == StepState::Reverted);

        transaction.flow.state = if compensation_failed {
            TransactionState::Failed
        } else if cause == RollbackCause::Cancel || reverted {
            TransactionState::Reverted
        } else {
            TransactionState::Failed
        };
        self.finish(transaction, hooks).await
    }

    async fn finish(
        &self,
        transaction: &mut TransactionCheckpoint,
        hooks: &dyn WorkflowEventHooks,
    ) -> Result<()> {
        self.checkpoint(transaction).await?;

        let state = transaction.state();
        metrics::counter!(
            "workflow_transactions_finished_total",
            "workflow_id" => self.id.clone(),
            "state" => state.as_str()
        )
        .increment(1);
        tracing::info!(
            workflow_id = %self.id,
            transaction_id = %transaction.transaction_id(),
            %state,
            "transaction finished"
        );

        let result = final_response(transaction);
        hooks
            .on_finish(transaction, result.as_ref(), &transaction.errors)
            .await;
        Ok(())
    }

    /// Loads the transaction addressed by `key` and decides how a response
    /// for its step is taken in.
    async fn accept_response(
        &self,
        key: &IdempotencyKey,
    ) -> Result<(TransactionCheckpoint, Accepted)> {
        if key.workflow_id() != self.id {
            return Err(WorkflowError::KeyMismatch {
                expected: self.id.clone(),
                actual: key.workflow_id().to_string(),
            });
        }

        let transaction = self
            .storage
            .get(&self.id, key.transaction_id())
            .await?
            .ok_or_else(|| WorkflowError::TransactionNotFound {
                workflow_id: self.id.clone(),
                transaction_id: key.transaction_id().clone(),
            })?;

        let index =
            transaction
                .flow
                .step_index(key.step_id())
                .ok_or_else(|| WorkflowError::StepNotFound {
                    workflow_id: self.id.clone(),
                    step_id: key.step_id().to_string(),
                })?;
        let state = transaction.flow.steps[index].state;
        let invalid = || WorkflowError::InvalidStepState {
            step_id: key.step_id().to_string(),
            action: key.action(),
            state,
        };

        if key.action() == StepAction::Compensate {
            return Err(invalid());
        }
        if transaction.has_finished() {
            return Ok((transaction, Accepted::Ignored));
        }
        let is_async = transaction.flow.steps[index].is_async;
        let held = transaction.flow.steps[index].pending_outcome.is_some();
        match state {
            StepState::Awaiting => Ok((transaction, Accepted::Awaiting(index))),
            StepState::Invoking if is_async && !held => Ok((transaction, Accepted::Running(index))),
            StepState::Invoking if is_async => Ok((transaction, Accepted::Ignored)),
            StepState::Done => Ok((transaction, Accepted::Ignored)),
            _ => Err(invalid()),
        }
    }

    /// Applies or holds an outcome for the step addressed by `key`.
    async fn register_outcome(
        &self,
        key: &IdempotencyKey,
        outcome: PendingOutcome,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult {
        let mut attempt = 0;
        loop {
            let (mut transaction, accepted) = match self.accept_response(key).await {
                Ok(accepted) => accepted,
                Err(e) => return WorkflowResult::thrown(e, None),
            };

            let index = match accepted {
                Accepted::Ignored => return WorkflowResult::from_transaction(transaction),
                Accepted::Awaiting(index) => index,
                Accepted::Running(index) => {
                    transaction.flow.steps[index].pending_outcome = Some(outcome.clone());
                    match self.checkpoint(&mut transaction).await {
                        Ok(()) => {
                            tracing::debug!(
                                workflow_id = %self.id,
                                step_id = %key.step_id(),
                                "holding outcome until the step's handler returns"
                            );
                            return WorkflowResult::from_transaction(transaction);
                        }
                        // The handler returned in the meantime; look again.
                        Err(e) if is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                            attempt += 1;
                            continue;
                        }
                        Err(e) => return WorkflowResult::thrown(e, Some(transaction)),
                    }
                }
            };

            let applied = async {
                match outcome {
                    PendingOutcome::Success(response) => {
                        self.complete_step(&mut transaction, index, response, hooks)
                            .await?;
                        self.advance(&mut transaction, hooks).await
                    }
                    PendingOutcome::Failure(error) => {
                        self.fail_step(&mut transaction, index, error, hooks).await?;
                        self.rollback(&mut transaction, RollbackCause::Failure, hooks)
                            .await
                    }
                }
            }
            .await;
            return Self::outcome(transaction, applied);
        }
    }
}

#[async_trait]
impl Workflow for StepWorkflow {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(
        &self,
        input: Value,
        context: ExecutionContext,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult {
        let transaction_id = context
            .transaction_id
            .clone()
            .unwrap_or_else(TransactionId::generate);

        let existing = match self.storage.get(&self.id, &transaction_id).await {
            Ok(existing) => existing,
            Err(e) => return WorkflowResult::thrown(e.into(), None),
        };

        match existing {
            Some(transaction) if transaction.has_finished() => {
                tracing::debug!(
                    workflow_id = %self.id,
                    %transaction_id,
                    "transaction already finished, replaying result"
                );
                WorkflowResult::from_transaction(transaction)
            }
            Some(mut transaction) => {
                hooks.on_resume(&transaction).await;
                let outcome = self.resume(&mut transaction, hooks).await;
                Self::outcome(transaction, outcome)
            }
            None => {
                let mut transaction = self.new_checkpoint(transaction_id, input, &context);
                transaction.flow.state = TransactionState::Invoking;
                if let Err(e) = self.storage.insert(&mut transaction).await {
                    return WorkflowResult::thrown(e.into(), None);
                }

                metrics::counter!(
                    "workflow_transactions_started_total",
                    "workflow_id" => self.id.clone()
                )
                .increment(1);
                hooks.on_begin(&transaction).await;
                let outcome = self.advance(&mut transaction, hooks).await;
                Self::outcome(transaction, outcome)
            }
        }
    }

    async fn cancel(
        &self,
        transaction: TransactionCheckpoint,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult {
        let mut transaction = transaction;
        if transaction.has_finished() {
            return WorkflowResult::from_transaction(transaction);
        }

        let outcome = self
            .rollback(&mut transaction, RollbackCause::Cancel, hooks)
            .await;
        Self::outcome(transaction, outcome)
    }

    async fn register_step_success(
        &self,
        key: &IdempotencyKey,
        response: Value,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult {
        self.register_outcome(key, PendingOutcome::Success(response), hooks)
            .await
    }

    async fn register_step_failure(
        &self,
        key: &IdempotencyKey,
        error: Value,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult {
        self.register_outcome(key, PendingOutcome::Failure(error), hooks)
            .await
    }

    async fn get_running_transaction(
        &self,
        transaction_id: &TransactionId,
        context: &ExecutionContext,
    ) -> Result<Option<TransactionCheckpoint>> {
        let Some(mut transaction) = self.storage.get(&self.id, transaction_id).await? else {
            return Ok(None);
        };

        // A step caught mid-invoke will never report back to this process.
        if context.is_cancelling {
            for step in &mut transaction.flow.steps {
                if step.state == StepState::Invoking {
                    step.state = StepState::Awaiting;
                }
            }
        }
        Ok(Some(transaction))
    }

    async fn timeout(
        &self,
        transaction_id: &TransactionId,
        hooks: &dyn WorkflowEventHooks,
    ) -> WorkflowResult {
        let context = ExecutionContext::new().cancelling();
        let mut transaction = match self.get_running_transaction(transaction_id, &context).await {
            Ok(Some(transaction)) => transaction,
            Ok(None) => {
                return WorkflowResult::thrown(
                    WorkflowError::TransactionNotFound {
                        workflow_id: self.id.clone(),
                        transaction_id: transaction_id.clone(),
                    },
                    None,
                );
            }
            Err(e) => return WorkflowResult::thrown(e, None),
        };

        if !transaction.flow.is_expired(Utc::now()) {
            return WorkflowResult::from_transaction(transaction);
        }

        hooks.on_timeout(&transaction).await;
        let outcome = self
            .rollback(&mut transaction, RollbackCause::Timeout, hooks)
            .await;
        Self::outcome(transaction, outcome)
    }
}
