//! Notification events delivered to subscribers.

use common::TransactionId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use transaction_store::{TransactionCheckpoint, TransactionStep, TransactionStepError};

/// Lifecycle event a notification reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationEventType {
    Begin,
    Resume,
    Timeout,
    StepBegin,
    StepSuccess,
    StepFailure,
    StepAwaiting,
    CompensateBegin,
    CompensateStepSuccess,
    CompensateStepFailure,
    Finish,
}

impl NotificationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Begin => "begin",
            Self::Resume => "resume",
            Self::Timeout => "timeout",
            Self::StepBegin => "stepBegin",
            Self::StepSuccess => "stepSuccess",
            Self::StepFailure => "stepFailure",
            Self::StepAwaiting => "stepAwaiting",
            Self::CompensateBegin => "compensateBegin",
            Self::CompensateStepSuccess => "compensateStepSuccess",
            Self::CompensateStepFailure => "compensateStepFailure",
            Self::Finish => "finish",
        }
    }

    /// Events that end the execution of a step.
    pub fn settles_step(&self) -> bool {
        matches!(
            self,
            Self::StepSuccess | Self::StepFailure | Self::StepAwaiting
        )
    }
}

impl std::fmt::Display for NotificationEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction lifecycle notification.
///
/// Events are ephemeral: they are handed to subscribers and, in the
/// distributed setup, published to peers, but never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub event_type: NotificationEventType,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<TransactionStep>,
    /// Response of the step the event is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    /// Final result of a finished transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<TransactionStepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_group_id: Option<String>,
}

impl NotificationEvent {
    pub fn new(event_type: NotificationEventType, workflow_id: impl Into<String>) -> Self {
        Self {
            event_type,
            workflow_id: workflow_id.into(),
            transaction_id: None,
            step: None,
            response: None,
            result: None,
            errors: Vec::new(),
            event_group_id: None,
        }
    }

    /// Event about a transaction, carrying its ids and event group.
    pub fn for_transaction(
        event_type: NotificationEventType,
        transaction: &TransactionCheckpoint,
    ) -> Self {
        Self {
            transaction_id: Some(transaction.transaction_id().clone()),
            event_group_id: transaction.flow.metadata.event_group_id.clone(),
            ..Self::new(event_type, transaction.workflow_id())
        }
    }

    pub fn with_step(mut self, step: &TransactionStep) -> Self {
        self.step = Some(step.clone());
        self
    }

    pub fn with_response(mut self, response: Option<Value>) -> Self {
        self.response = response;
        self
    }

    pub fn with_result(mut self, result: Option<Value>) -> Self {
        self.result = result;
        self
    }

    pub fn with_errors(mut self, errors: Vec<TransactionStepError>) -> Self {
        self.errors = errors;
        self
    }

    pub fn step_id(&self) -> Option<&str> {
        self.step.as_ref().map(|s| s.id.as_str())
    }
}

/// Wire format of a notification published to peer instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEnvelope {
    /// Instance that published the notification.
    pub instance_id: String,
    pub data: NotificationEvent,
}
