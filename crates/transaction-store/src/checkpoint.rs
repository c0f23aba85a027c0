use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{IdempotencyKey, StepAction, TransactionId};
use serde::{Deserialize, Serialize};

/// Version number of a stored checkpoint, used for optimistic concurrency control.
///
/// A checkpoint that has never been saved is at version 0; every successful
/// save increments the version by 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a new version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) of an unsaved checkpoint.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a whole transaction.
///
/// ```text
/// NotStarted ──► Invoking ──┬──────────────────────────► Done
///                           └──► Compensating ──┬──► Reverted
///                                               └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    #[default]
    NotStarted,
    Invoking,
    Compensating,
    Done,
    Reverted,
    Failed,
}

impl TransactionState {
    /// Returns true for the terminal states `Done`, `Reverted` and `Failed`.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransactionState::Done | TransactionState::Reverted | TransactionState::Failed
        )
    }

    /// Returns the state name as stored and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::NotStarted => "not_started",
            TransactionState::Invoking => "invoking",
            TransactionState::Compensating => "compensating",
            TransactionState::Done => "done",
            TransactionState::Reverted => "reverted",
            TransactionState::Failed => "failed",
        }
    }

    /// Parses a stored state name.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_started" => Some(TransactionState::NotStarted),
            "invoking" => Some(TransactionState::Invoking),
            "compensating" => Some(TransactionState::Compensating),
            "done" => Some(TransactionState::Done),
            "reverted" => Some(TransactionState::Reverted),
            "failed" => Some(TransactionState::Failed),
            _ => None,
        }
    }

    /// The finished states.
    pub fn finished() -> [TransactionState; 3] {
        [
            TransactionState::Done,
            TransactionState::Reverted,
            TransactionState::Failed,
        ]
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single step within a transaction flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    NotStarted,
    Invoking,
    /// Invoked, waiting for its outcome to be registered from outside.
    Awaiting,
    Done,
    Failed,
    /// Never invoked because the transaction was compensated first.
    Skipped,
    Compensating,
    Reverted,
    CompensationFailed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::NotStarted => "not_started",
            StepState::Invoking => "invoking",
            StepState::Awaiting => "awaiting",
            StepState::Done => "done",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
            StepState::Compensating => "compensating",
            StepState::Reverted => "reverted",
            StepState::CompensationFailed => "compensation_failed",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a transaction flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStep {
    /// Step identifier, unique within the workflow.
    pub id: String,
    pub state: StepState,
    /// Whether the step waits for an externally registered outcome.
    pub is_async: bool,
    /// Whether the step declares a compensating action.
    pub has_compensation: bool,
    /// Number of times the invoke handler has been started.
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Outcome registered while the invoke handler was still running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_outcome: Option<PendingOutcome>,
}

impl TransactionStep {
    /// Creates a step that has not started yet.
    pub fn new(id: impl Into<String>, is_async: bool, has_compensation: bool) -> Self {
        Self {
            id: id.into(),
            state: StepState::NotStarted,
            is_async,
            has_compensation,
            attempts: 0,
            started_at: None,
            completed_at: None,
            pending_outcome: None,
        }
    }
}

/// Outcome of an async step, held until its invoke handler returns.
///
/// A step whose handler starts a child transaction can hear back from that
/// child before the handler itself has returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PendingOutcome {
    Success(serde_json::Value),
    Failure(serde_json::Value),
}

/// Metadata linking a transaction to its surroundings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowMetadata {
    /// Step of an enclosing transaction waiting on this one.
    pub parent_step_idempotency_key: Option<IdempotencyKey>,
    /// Groups the events of related transactions.
    pub event_group_id: Option<String>,
}

/// The step graph and lifecycle state of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionFlow {
    pub workflow_id: String,
    pub transaction_id: TransactionId,
    pub state: TransactionState,
    /// Steps in execution order.
    pub steps: Vec<TransactionStep>,
    pub metadata: FlowMetadata,
    pub timeout_at: Option<DateTime<Utc>>,
    pub timed_out: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransactionFlow {
    /// Creates a flow in the `NotStarted` state.
    pub fn new(
        workflow_id: impl Into<String>,
        transaction_id: TransactionId,
        steps: Vec<TransactionStep>,
    ) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            transaction_id,
            state: TransactionState::NotStarted,
            steps,
            metadata: FlowMetadata::default(),
            timeout_at: None,
            timed_out: false,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true once the transaction reached a terminal state.
    pub fn has_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Looks up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&TransactionStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Returns the position of a step by id.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }

    /// Returns true if the deadline has passed for an unfinished transaction.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.has_finished() && self.timeout_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Data threaded through the steps of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionContext {
    /// Input the transaction was started with.
    pub payload: serde_json::Value,
    /// Invoke responses keyed by step id.
    pub invoke: HashMap<String, serde_json::Value>,
    /// Compensation responses keyed by step id.
    pub compensate: HashMap<String, serde_json::Value>,
}

impl TransactionContext {
    /// Creates a context for the given input.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Default::default()
        }
    }
}

/// An error raised by a step handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStepError {
    /// Id of the step whose handler failed.
    pub action: String,
    /// Which handler failed.
    pub handler_type: StepAction,
    /// Error payload as reported by the handler.
    pub error: serde_json::Value,
}

impl TransactionStepError {
    pub fn new(
        action: impl Into<String>,
        handler_type: StepAction,
        error: serde_json::Value,
    ) -> Self {
        Self {
            action: action.into(),
            handler_type,
            error,
        }
    }

    /// Returns the error message if the payload carries one.
    pub fn message(&self) -> String {
        match &self.error {
            serde_json::Value::String(message) => message.clone(),
            serde_json::Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.error.to_string()),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for TransactionStepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "step '{}' failed during {}: {}",
            self.action,
            self.handler_type,
            self.message()
        )
    }
}

/// The persisted unit of transaction state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCheckpoint {
    pub flow: TransactionFlow,
    pub context: TransactionContext,
    /// Step errors accumulated so far, in the order they occurred.
    pub errors: Vec<TransactionStepError>,
    /// Version of the stored copy this checkpoint was read from.
    pub version: Version,
}

impl TransactionCheckpoint {
    /// Creates an unsaved checkpoint.
    pub fn new(flow: TransactionFlow, context: TransactionContext) -> Self {
        Self {
            flow,
            context,
            errors: Vec::new(),
            version: Version::initial(),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.flow.workflow_id
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.flow.transaction_id
    }

    pub fn state(&self) -> TransactionState {
        self.flow.state
    }

    pub fn has_finished(&self) -> bool {
        self.flow.has_finished()
    }
}
