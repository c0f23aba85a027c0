//! Step definitions for [`StepWorkflow`](crate::StepWorkflow).

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use common::{IdempotencyKey, TransactionId};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

/// Error payload returned by a failing step handler.
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub error: Value,
}

impl StepFailure {
    pub fn new(error: Value) -> Self {
        Self { error }
    }

    /// Failure carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            error: json!({ "message": message.into() }),
        }
    }
}

impl From<&str> for StepFailure {
    fn from(message: &str) -> Self {
        Self::message(message)
    }
}

impl From<String> for StepFailure {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}

/// Everything a step handler gets to see.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub workflow_id: String,
    pub transaction_id: TransactionId,
    pub step_id: String,
    /// Key under which an async outcome must be registered.
    pub idempotency_key: IdempotencyKey,
    /// Input the transaction was started with.
    pub payload: Value,
    /// Responses of the steps completed so far.
    pub responses: HashMap<String, Value>,
    /// The step's own invoke response; only set for compensation.
    pub response: Option<Value>,
}

pub type StepFuture = BoxFuture<'static, Result<Value, StepFailure>>;
pub type StepHandler = Arc<dyn Fn(StepInput) -> StepFuture + Send + Sync>;

fn boxed<F, Fut>(handler: F) -> StepHandler
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, StepFailure>> + Send + 'static,
{
    Arc::new(move |input| handler(input).boxed())
}

/// A step with an invoke handler and an optional compensation.
///
/// ```ignore
/// let reserve = StepDefinition::new("reserve", |input| async move {
///     Ok(json!({ "reservation": input.transaction_id.to_string() }))
/// })
/// .compensate(|_input| async move { Ok(Value::Null) });
/// ```
#[derive(Clone)]
pub struct StepDefinition {
    id: String,
    invoke: StepHandler,
    compensate: Option<StepHandler>,
    is_async: bool,
}

impl StepDefinition {
    pub fn new<F, Fut>(id: impl Into<String>, invoke: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepFailure>> + Send + 'static,
    {
        Self {
            id: id.into(),
            invoke: boxed(invoke),
            compensate: None,
            is_async: false,
        }
    }

    /// Sets the handler that undoes the step.
    pub fn compensate<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(StepInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepFailure>> + Send + 'static,
    {
        self.compensate = Some(boxed(compensate));
        self
    }

    /// Marks the step as async: after its invoke handler returns, the step
    /// waits until its outcome is registered through its idempotency key.
    pub fn async_step(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_async(&self) -> bool {
        self.is_async
    }

    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }

    pub(crate) async fn run_invoke(&self, input: StepInput) -> Result<Value, StepFailure> {
        guarded(&self.id, (self.invoke)(input)).await
    }

    pub(crate) async fn run_compensate(&self, input: StepInput) -> Option<Result<Value, StepFailure>> {
        let compensate = self.compensate.as_ref()?;
        Some(guarded(&self.id, compensate(input)).await)
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("is_async", &self.is_async)
            .field("has_compensation", &self.has_compensation())
            .finish()
    }
}

// A panicking handler counts as a failed step.
async fn guarded(step_id: &str, future: StepFuture) -> Result<Value, StepFailure> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(step_id, "step handler panicked");
            Err(StepFailure::message(format!("step '{step_id}' panicked")))
        }
    }
}
