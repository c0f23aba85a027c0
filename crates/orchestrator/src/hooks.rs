//! Lifecycle hooks that forward engine events to the notification hub.

use std::sync::Arc;

use async_trait::async_trait;
use common::StepAction;
use serde_json::Value;
use tokio::sync::Mutex;
use transaction_store::{TransactionCheckpoint, TransactionStep, TransactionStepError};
use workflow_engine::WorkflowEventHooks;

use crate::events::{NotificationEvent, NotificationEventType};
use crate::notifier::NotificationHub;

/// The finish event held back until the orchestrator has handled the
/// parent step.
#[derive(Debug, Clone)]
pub struct FinishedTransaction {
    pub transaction: TransactionCheckpoint,
    pub result: Option<Value>,
    pub errors: Vec<TransactionStepError>,
}

/// Hooks built for a single orchestrator call.
///
/// Each hook first runs the caller's own hooks, if any, then notifies the
/// hub with a payload derived from the transaction. `on_finish` is only
/// captured; [`OrchestratorHooks::emit_finish`] delivers it later.
pub struct OrchestratorHooks {
    hub: Arc<NotificationHub>,
    custom: Option<Arc<dyn WorkflowEventHooks>>,
    finished: Mutex<Option<FinishedTransaction>>,
}

impl OrchestratorHooks {
    pub fn new(hub: Arc<NotificationHub>, custom: Option<Arc<dyn WorkflowEventHooks>>) -> Self {
        Self {
            hub,
            custom,
            finished: Mutex::new(None),
        }
    }

    /// Takes the captured finish event, if the transaction finished during the call.
    pub async fn take_finished(&self) -> Option<FinishedTransaction> {
        self.finished.lock().await.take()
    }

    /// Runs the caller's `on_finish` and notifies subscribers of the finish.
    pub async fn emit_finish(&self, finished: FinishedTransaction) {
        if let Some(custom) = &self.custom {
            custom
                .on_finish(
                    &finished.transaction,
                    finished.result.as_ref(),
                    &finished.errors,
                )
                .await;
        }

        let event = NotificationEvent::for_transaction(
            NotificationEventType::Finish,
            &finished.transaction,
        )
        .with_result(finished.result)
        .with_errors(finished.errors);
        self.hub.notify(event).await;
    }

    async fn transaction_event(
        &self,
        event_type: NotificationEventType,
        transaction: &TransactionCheckpoint,
    ) {
        self.hub
            .notify(NotificationEvent::for_transaction(event_type, transaction))
            .await;
    }

    async fn step_event(
        &self,
        event_type: NotificationEventType,
        transaction: &TransactionCheckpoint,
        step: &TransactionStep,
    ) {
        let event = NotificationEvent::for_transaction(event_type, transaction).with_step(step);
        let event = match event_type {
            NotificationEventType::StepSuccess => {
                event.with_response(transaction.context.invoke.get(&step.id).cloned())
            }
            NotificationEventType::CompensateStepSuccess => {
                event.with_response(transaction.context.compensate.get(&step.id).cloned())
            }
            NotificationEventType::StepFailure => {
                event.with_errors(step_errors(transaction, &step.id, StepAction::Invoke))
            }
            NotificationEventType::CompensateStepFailure => {
                event.with_errors(step_errors(transaction, &step.id, StepAction::Compensate))
            }
            _ => event,
        };
        self.hub.notify(event).await;
    }
}

fn step_errors(
    transaction: &TransactionCheckpoint,
    step_id: &str,
    action: StepAction,
) -> Vec<TransactionStepError> {
    transaction
        .errors
        .iter()
        .filter(|e| e.action == step_id && e.handler_type == action)
        .cloned()
        .collect()
}

#[async_trait]
impl WorkflowEventHooks for OrchestratorHooks {
    async fn on_begin(&self, transaction: &TransactionCheckpoint) {
        if let Some(custom) = &self.custom {
            custom.on_begin(transaction).await;
        }
        self.transaction_event(NotificationEventType::Begin, transaction)
            .await;
    }

    async fn on_resume(&self, transaction: &TransactionCheckpoint) {
        if let Some(custom) = &self.custom {
            custom.on_resume(transaction).await;
        }
        self.transaction_event(NotificationEventType::Resume, transaction)
            .await;
    }

    async fn on_timeout(&self, transaction: &TransactionCheckpoint) {
        if let Some(custom) = &self.custom {
            custom.on_timeout(transaction).await;
        }
        self.transaction_event(NotificationEventType::Timeout, transaction)
            .await;
    }

    async fn on_step_begin(&self, transaction: &TransactionCheckpoint, step: &TransactionStep) {
        if let Some(custom) = &self.custom {
            custom.on_step_begin(transaction, step).await;
        }
        self.step_event(NotificationEventType::StepBegin, transaction, step)
            .await;
    }

    async fn on_step_success(&self, transaction: &TransactionCheckpoint, step: &TransactionStep) {
        if let Some(custom) = &self.custom {
            custom.on_step_success(transaction, step).await;
        }
        self.step_event(NotificationEventType::StepSuccess, transaction, step)
            .await;
    }

    async fn on_step_failure(&self, transaction: &TransactionCheckpoint, step: &TransactionStep) {
        if let Some(custom) = &self.custom {
            custom.on_step_failure(transaction, step).await;
        }
        self.step_event(NotificationEventType::StepFailure, transaction, step)
            .await;
    }

    async fn on_step_awaiting(&self, transaction: &TransactionCheckpoint, step: &TransactionStep) {
        if let Some(custom) = &self.custom {
            custom.on_step_awaiting(transaction, step).await;
        }
        self.step_event(NotificationEventType::StepAwaiting, transaction, step)
            .await;
    }

    async fn on_compensate_begin(&self, transaction: &TransactionCheckpoint) {
        if let Some(custom) = &self.custom {
            custom.on_compensate_begin(transaction).await;
        }
        self.transaction_event(NotificationEventType::CompensateBegin, transaction)
            .await;
    }

    async fn on_compensate_step_success(
        &self,
        transaction: &TransactionCheckpoint,
        step: &TransactionStep,
    ) {
        if let Some(custom) = &self.custom {
            custom.on_compensate_step_success(transaction, step).await;
        }
        self.step_event(NotificationEventType::CompensateStepSuccess, transaction, step)
            .await;
    }

    async fn on_compensate_step_failure(
        &self,
        transaction: &TransactionCheckpoint,
        step: &TransactionStep,
    ) {
        if let Some(custom) = &self.custom {
            custom.on_compensate_step_failure(transaction, step).await;
        }
        self.step_event(NotificationEventType::CompensateStepFailure, transaction, step)
            .await;
    }

    async fn on_finish(
        &self,
        transaction: &TransactionCheckpoint,
        result: Option<&Value>,
        errors: &[TransactionStepError],
    ) {
        *self.finished.lock().await = Some(FinishedTransaction {
            transaction: transaction.clone(),
            result: result.cloned(),
            errors: errors.to_vec(),
        });
    }
}
