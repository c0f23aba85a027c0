//! Integration tests for the sequential step engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{IdempotencyKey, TransactionId};
use serde_json::{Value, json};
use transaction_store::{
    InMemoryTransactionStorage, StepState, TransactionCheckpoint, TransactionState,
    TransactionStep, TransactionStepError, TransactionStorage, TransactionStorageExt,
};
use workflow_engine::{
    ExecutionContext, NoopHooks, StepDefinition, StepFailure, StepWorkflow, Workflow,
    WorkflowError, WorkflowEventHooks,
};

/// Records which side effects the steps performed and can be told to fail.
#[derive(Default)]
struct Services {
    calls: Mutex<Vec<String>>,
    fail_charge: AtomicBool,
    fail_refund: AtomicBool,
}

impl Services {
    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl RecordingHooks {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowEventHooks for RecordingHooks {
    async fn on_begin(&self, _transaction: &TransactionCheckpoint) {
        self.push("begin".into());
    }

    async fn on_resume(&self, _transaction: &TransactionCheckpoint) {
        self.push("resume".into());
    }

    async fn on_timeout(&self, _transaction: &TransactionCheckpoint) {
        self.push("timeout".into());
    }

    async fn on_step_begin(&self, _transaction: &TransactionCheckpoint, step: &TransactionStep) {
        self.push(format!("step_begin:{}", step.id));
    }

    async fn on_step_success(&self, _transaction: &TransactionCheckpoint, step: &TransactionStep) {
        self.push(format!("step_success:{}", step.id));
    }

    async fn on_step_failure(&self, _transaction: &TransactionCheckpoint, step: &TransactionStep) {
        self.push(format!("step_failure:{}", step.id));
    }

    async fn on_step_awaiting(&self, _transaction: &TransactionCheckpoint, step: &TransactionStep) {
        self.push(format!("step_awaiting:{}", step.id));
    }

    async fn on_compensate_begin(&self, _transaction: &TransactionCheckpoint) {
        self.push("compensate_begin".into());
    }

    async fn on_compensate_step_success(
        &self,
        _transaction: &TransactionCheckpoint,
        step: &TransactionStep,
    ) {
        self.push(format!("compensate_success:{}", step.id));
    }

    async fn on_compensate_step_failure(
        &self,
        _transaction: &TransactionCheckpoint,
        step: &TransactionStep,
    ) {
        self.push(format!("compensate_failure:{}", step.id));
    }

    async fn on_finish(
        &self,
        transaction: &TransactionCheckpoint,
        _result: Option<&Value>,
        _errors: &[TransactionStepError],
    ) {
        self.push(format!("finish:{}", transaction.state()));
    }
}

struct TestHarness {
    storage: Arc<InMemoryTransactionStorage>,
    services: Arc<Services>,
    hooks: RecordingHooks,
}

impl TestHarness {
    fn new() -> Self {
        Self {
            storage: Arc::new(InMemoryTransactionStorage::new()),
            services: Arc::new(Services::default()),
            hooks: RecordingHooks::default(),
        }
    }

    fn reserve_step(&self) -> StepDefinition {
        let invoke = self.services.clone();
        let release = self.services.clone();
        StepDefinition::new("reserve", move |input| {
            let services = invoke.clone();
            async move {
                services.record("reserve");
                Ok(json!({ "reservation": format!("res-{}", input.transaction_id) }))
            }
        })
        .compensate(move |input| {
            let services = release.clone();
            async move {
                services.record("release");
                Ok(json!({ "released": input.response }))
            }
        })
    }

    fn charge_step(&self) -> StepDefinition {
        let invoke = self.services.clone();
        let refund = self.services.clone();
        StepDefinition::new("charge", move |_input| {
            let services = invoke.clone();
            async move {
                services.record("charge");
                if services.fail_charge.load(Ordering::SeqCst) {
                    return Err(StepFailure::message("card declined"));
                }
                Ok(json!({ "payment": "pay-1" }))
            }
        })
        .compensate(move |_input| {
            let services = refund.clone();
            async move {
                services.record("refund");
                if services.fail_refund.load(Ordering::SeqCst) {
                    return Err(StepFailure::message("refund rejected"));
                }
                Ok(Value::Null)
            }
        })
    }

    fn ship_step(&self) -> StepDefinition {
        let invoke = self.services.clone();
        StepDefinition::new("ship", move |input| {
            let services = invoke.clone();
            async move {
                services.record("ship");
                Ok(json!({
                    "tracking": "TRK-1",
                    "payment": input.responses.get("charge").map(|r| r["payment"].clone())
                }))
            }
        })
    }

    fn checkout(&self) -> StepWorkflow {
        StepWorkflow::builder("checkout")
            .step(self.reserve_step())
            .step(self.charge_step())
            .step(self.ship_step())
            .build(self.storage.clone())
    }

    /// reserve, then an async confirmation step, then ship.
    fn checkout_with_confirmation(&self) -> StepWorkflow {
        let confirm = self.services.clone();
        StepWorkflow::builder("checkout")
            .step(self.reserve_step())
            .step(
                StepDefinition::new("confirm", move |_input| {
                    let services = confirm.clone();
                    async move {
                        services.record("request_confirmation");
                        Ok(Value::Null)
                    }
                })
                .async_step(),
            )
            .step(self.ship_step())
            .build(self.storage.clone())
    }

    /// Like [`Self::checkout_with_confirmation`], but the confirmation arrives
    /// through a second engine instance before the confirm handler returns.
    fn checkout_confirmed_while_invoking(&self, answers: Vec<Result<Value, Value>>) -> StepWorkflow {
        let responder = Arc::new(self.checkout_with_confirmation());
        StepWorkflow::builder("checkout")
            .step(self.reserve_step())
            .step(
                StepDefinition::new("confirm", move |input| {
                    let responder = responder.clone();
                    let answers = answers.clone();
                    async move {
                        for answer in answers {
                            let key = &input.idempotency_key;
                            let result = match answer {
                                Ok(response) => {
                                    responder
                                        .register_step_success(key, response, &NoopHooks)
                                        .await
                                }
                                Err(error) => {
                                    responder
                                        .register_step_failure(key, error, &NoopHooks)
                                        .await
                                }
                            };
                            assert!(result.thrown_error.is_none());
                            assert!(!result.has_finished());
                        }
                        Ok(Value::Null)
                    }
                })
                .async_step(),
            )
            .step(self.ship_step())
            .build(self.storage.clone())
    }

    async fn stored(&self, transaction_id: &str) -> TransactionCheckpoint {
        self.storage
            .get("checkout", &TransactionId::new(transaction_id))
            .await
            .unwrap()
            .unwrap()
    }
}

fn key(step: &str) -> IdempotencyKey {
    IdempotencyKey::invoke("checkout", "tx-1", step).unwrap()
}

#[tokio::test]
async fn all_steps_succeed() {
    let h = TestHarness::new();
    let workflow = h.checkout();

    let result = workflow
        .run(
            json!({"cart": "c1"}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    assert!(result.thrown_error.is_none());
    assert!(result.errors.is_empty());
    assert!(result.has_finished());
    assert_eq!(
        result.result,
        Some(json!({"tracking": "TRK-1", "payment": "pay-1"}))
    );

    let stored = h.stored("tx-1").await;
    assert_eq!(stored.state(), TransactionState::Done);
    assert!(stored.flow.steps.iter().all(|s| s.state == StepState::Done));
    assert_eq!(stored.context.payload, json!({"cart": "c1"}));

    assert_eq!(h.services.calls(), vec!["reserve", "charge", "ship"]);
    assert_eq!(
        h.hooks.events(),
        vec![
            "begin",
            "step_begin:reserve",
            "step_success:reserve",
            "step_begin:charge",
            "step_success:charge",
            "step_begin:ship",
            "step_success:ship",
            "finish:done",
        ]
    );
}

#[tokio::test]
async fn generated_transaction_id_when_absent() {
    let h = TestHarness::new();
    let workflow = h.checkout();

    let result = workflow
        .run(json!({}), ExecutionContext::new(), &h.hooks)
        .await;

    let transaction = result.transaction.unwrap();
    assert!(!transaction.transaction_id().is_empty());
    assert_eq!(transaction.state(), TransactionState::Done);
}

#[tokio::test]
async fn finished_transaction_is_replayed_not_reexecuted() {
    let h = TestHarness::new();
    let workflow = h.checkout();
    let context = ExecutionContext::new().with_transaction_id("tx-1");

    workflow.run(json!({}), context.clone(), &h.hooks).await;
    let replay_hooks = RecordingHooks::default();
    let replay = workflow.run(json!({}), context, &replay_hooks).await;

    assert!(replay.has_finished());
    assert!(replay.result.is_some());
    assert_eq!(h.services.calls(), vec!["reserve", "charge", "ship"]);
    assert!(replay_hooks.events().is_empty());
}

#[tokio::test]
async fn failing_step_compensates_in_reverse_order() {
    let h = TestHarness::new();
    h.services.fail_charge.store(true, Ordering::SeqCst);
    let workflow = h.checkout();

    let result = workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    assert!(result.thrown_error.is_none());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].action, "charge");
    assert_eq!(result.errors[0].message(), "card declined");
    assert!(result.result.is_none());

    let stored = h.stored("tx-1").await;
    assert_eq!(stored.state(), TransactionState::Reverted);
    assert_eq!(stored.flow.steps[0].state, StepState::Reverted);
    assert_eq!(stored.flow.steps[1].state, StepState::Failed);
    assert_eq!(stored.flow.steps[2].state, StepState::Skipped);
    assert_eq!(
        stored.context.compensate["reserve"],
        json!({"released": {"reservation": "res-tx-1"}})
    );

    assert_eq!(h.services.calls(), vec!["reserve", "charge", "release"]);
    assert_eq!(
        h.hooks.events(),
        vec![
            "begin",
            "step_begin:reserve",
            "step_success:reserve",
            "step_begin:charge",
            "step_failure:charge",
            "compensate_begin",
            "compensate_success:reserve",
            "finish:reverted",
        ]
    );
}

#[tokio::test]
async fn failing_compensation_fails_transaction() {
    let h = TestHarness::new();
    let services = h.services.clone();
    let workflow = StepWorkflow::builder("checkout")
        .step(h.reserve_step())
        .step(h.charge_step())
        .step(StepDefinition::new("ship", move |_input| {
            let services = services.clone();
            async move {
                services.record("ship");
                Err(StepFailure::message("no courier"))
            }
        }))
        .build(h.storage.clone());
    h.services.fail_refund.store(true, Ordering::SeqCst);

    let result = workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    let transaction = result.transaction.unwrap();
    assert_eq!(transaction.state(), TransactionState::Failed);
    assert_eq!(transaction.flow.steps[1].state, StepState::CompensationFailed);
    assert_eq!(transaction.flow.steps[0].state, StepState::Reverted);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(result.errors[1].message(), "refund rejected");
    assert_eq!(
        h.services.calls(),
        vec!["reserve", "charge", "ship", "refund", "release"]
    );
}

#[tokio::test]
async fn async_step_waits_for_registered_success() {
    let h = TestHarness::new();
    let workflow = h.checkout_with_confirmation();

    let result = workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    assert!(!result.has_finished());
    let stored = h.stored("tx-1").await;
    assert_eq!(stored.state(), TransactionState::Invoking);
    assert_eq!(stored.flow.steps[1].state, StepState::Awaiting);

    let result = workflow
        .register_step_success(&key("confirm"), json!({"confirmed": true}), &h.hooks)
        .await;

    assert!(result.thrown_error.is_none());
    assert!(result.has_finished());
    let stored = h.stored("tx-1").await;
    assert_eq!(stored.state(), TransactionState::Done);
    assert_eq!(stored.context.invoke["confirm"], json!({"confirmed": true}));
    assert_eq!(
        h.services.calls(),
        vec!["reserve", "request_confirmation", "ship"]
    );
    assert_eq!(
        h.hooks.events(),
        vec![
            "begin",
            "step_begin:reserve",
            "step_success:reserve",
            "step_begin:confirm",
            "step_awaiting:confirm",
            "step_success:confirm",
            "step_begin:ship",
            "step_success:ship",
            "finish:done",
        ]
    );
}

#[tokio::test]
async fn success_registered_while_invoking_is_applied_once_handler_returns() {
    let h = TestHarness::new();
    let workflow = h.checkout_confirmed_while_invoking(vec![
        Ok(json!({"confirmed": "first"})),
        Ok(json!({"confirmed": "second"})),
    ]);

    let result = workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    assert!(result.thrown_error.is_none());
    assert!(result.has_finished());
    let stored = h.stored("tx-1").await;
    assert_eq!(stored.state(), TransactionState::Done);
    assert_eq!(stored.context.invoke["confirm"], json!({"confirmed": "first"}));
    assert!(stored.flow.steps[1].pending_outcome.is_none());
    assert_eq!(h.services.calls(), vec!["reserve", "ship"]);
    assert_eq!(
        h.hooks.events(),
        vec![
            "begin",
            "step_begin:reserve",
            "step_success:reserve",
            "step_begin:confirm",
            "step_success:confirm",
            "step_begin:ship",
            "step_success:ship",
            "finish:done",
        ]
    );
}

#[tokio::test]
async fn failure_registered_while_invoking_rolls_back() {
    let h = TestHarness::new();
    let workflow =
        h.checkout_confirmed_while_invoking(vec![Err(json!({"message": "not confirmed"}))]);

    let result = workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    assert!(result.thrown_error.is_none());
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].message(), "not confirmed");
    let stored = h.stored("tx-1").await;
    assert_eq!(stored.state(), TransactionState::Reverted);
    assert_eq!(stored.flow.steps[0].state, StepState::Reverted);
    assert_eq!(stored.flow.steps[1].state, StepState::Failed);
    assert_eq!(stored.flow.steps[2].state, StepState::Skipped);
    assert_eq!(h.services.calls(), vec!["reserve", "release"]);
}

#[tokio::test]
async fn registered_failure_without_compensation_fails_transaction() {
    let h = TestHarness::new();
    let workflow = StepWorkflow::builder("checkout")
        .step(StepDefinition::new("step1", |_| async { Ok(Value::Null) }).async_step())
        .build(h.storage.clone());

    workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;
    let result = workflow
        .register_step_failure(&key("step1"), json!({"message": "rejected"}), &h.hooks)
        .await;

    let transaction = result.transaction.unwrap();
    assert_eq!(transaction.state(), TransactionState::Failed);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].message(), "rejected");
}

#[tokio::test]
async fn duplicate_responses_after_finish_are_ignored() {
    let h = TestHarness::new();
    let workflow = h.checkout_with_confirmation();
    let context = ExecutionContext::new().with_transaction_id("tx-1");

    workflow.run(json!({}), context, &h.hooks).await;
    workflow
        .register_step_success(&key("confirm"), json!(1), &h.hooks)
        .await;
    let again = workflow
        .register_step_success(&key("confirm"), json!(2), &h.hooks)
        .await;
    let failure = workflow
        .register_step_failure(&key("confirm"), json!("late"), &h.hooks)
        .await;

    assert!(again.thrown_error.is_none());
    assert!(failure.thrown_error.is_none());
    assert_eq!(h.stored("tx-1").await.context.invoke["confirm"], json!(1));
    let finishes = h
        .hooks
        .events()
        .into_iter()
        .filter(|e| e.starts_with("finish"))
        .count();
    assert_eq!(finishes, 1);
}

#[tokio::test]
async fn compensate_key_is_rejected() {
    let h = TestHarness::new();
    let workflow = h.checkout_with_confirmation();
    workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    let key = IdempotencyKey::compensate("checkout", "tx-1", "confirm").unwrap();
    let result = workflow
        .register_step_success(&key, Value::Null, &h.hooks)
        .await;

    assert!(matches!(
        result.thrown_error,
        Some(WorkflowError::InvalidStepState { .. })
    ));
    assert_eq!(
        h.stored("tx-1").await.flow.steps[1].state,
        StepState::Awaiting
    );
}

#[tokio::test]
async fn response_for_unknown_targets() {
    let h = TestHarness::new();
    let workflow = h.checkout_with_confirmation();
    workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    let other_workflow = IdempotencyKey::invoke("refund", "tx-1", "confirm").unwrap();
    let result = workflow
        .register_step_success(&other_workflow, Value::Null, &h.hooks)
        .await;
    assert!(matches!(
        result.thrown_error,
        Some(WorkflowError::KeyMismatch { .. })
    ));

    let missing_tx = IdempotencyKey::invoke("checkout", "tx-2", "confirm").unwrap();
    let result = workflow
        .register_step_success(&missing_tx, Value::Null, &h.hooks)
        .await;
    assert!(matches!(
        result.thrown_error,
        Some(WorkflowError::TransactionNotFound { .. })
    ));

    let result = workflow
        .register_step_success(&key("nope"), Value::Null, &h.hooks)
        .await;
    assert!(matches!(
        result.thrown_error,
        Some(WorkflowError::StepNotFound { .. })
    ));

    // "reserve" already completed synchronously, so its response is a duplicate.
    let result = workflow
        .register_step_success(&key("reserve"), Value::Null, &h.hooks)
        .await;
    assert!(result.thrown_error.is_none());
}

#[tokio::test]
async fn cancel_running_transaction_reverts() {
    let h = TestHarness::new();
    let workflow = h.checkout_with_confirmation();
    workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    let transaction = workflow
        .get_running_transaction(
            &TransactionId::new("tx-1"),
            &ExecutionContext::new().cancelling(),
        )
        .await
        .unwrap()
        .unwrap();
    let result = workflow.cancel(transaction, &h.hooks).await;

    assert!(result.thrown_error.is_none());
    let stored = h.stored("tx-1").await;
    assert_eq!(stored.state(), TransactionState::Reverted);
    assert!(stored.flow.cancelled_at.is_some());
    assert_eq!(stored.flow.steps[0].state, StepState::Reverted);
    assert_eq!(stored.flow.steps[1].state, StepState::Skipped);
    assert_eq!(stored.flow.steps[2].state, StepState::Skipped);
    assert_eq!(
        h.services.calls(),
        vec!["reserve", "request_confirmation", "release"]
    );

    // Late outcome for the cancelled step is ignored.
    let late = workflow
        .register_step_success(&key("confirm"), Value::Null, &h.hooks)
        .await;
    assert!(late.thrown_error.is_none());
    assert_eq!(h.stored("tx-1").await.state(), TransactionState::Reverted);
}

#[tokio::test]
async fn cancel_finished_transaction_is_a_no_op() {
    let h = TestHarness::new();
    let workflow = h.checkout();
    workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    let transaction = h.stored("tx-1").await;
    let result = workflow.cancel(transaction, &h.hooks).await;

    assert_eq!(
        result.transaction.unwrap().state(),
        TransactionState::Done
    );
    assert!(!h.services.calls().contains(&"release".to_string()));
}

#[tokio::test]
async fn cancelling_lookup_reconstructs_mid_invoke_steps() {
    let h = TestHarness::new();
    let workflow = h.checkout();

    let mut transaction = {
        let mut checkpoint = TransactionCheckpoint::new(
            transaction_store::TransactionFlow::new(
                "checkout",
                TransactionId::new("tx-1"),
                vec![
                    TransactionStep::new("reserve", false, true),
                    TransactionStep::new("charge", false, true),
                    TransactionStep::new("ship", false, false),
                ],
            ),
            transaction_store::TransactionContext::new(json!({})),
        );
        checkpoint.flow.state = TransactionState::Invoking;
        checkpoint.flow.steps[0].state = StepState::Done;
        checkpoint.flow.steps[1].state = StepState::Invoking;
        checkpoint
    };
    h.storage.insert(&mut transaction).await.unwrap();

    let id = TransactionId::new("tx-1");
    let plain = workflow
        .get_running_transaction(&id, &ExecutionContext::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(plain.flow.steps[1].state, StepState::Invoking);

    let cancelling = workflow
        .get_running_transaction(&id, &ExecutionContext::new().cancelling())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelling.flow.steps[1].state, StepState::Awaiting);

    // The lookup itself never writes.
    assert_eq!(h.stored("tx-1").await.flow.steps[1].state, StepState::Invoking);
}

#[tokio::test]
async fn resume_does_not_reinvoke_mid_flight_step() {
    let h = TestHarness::new();
    let workflow = h.checkout();

    let mut transaction = TransactionCheckpoint::new(
        transaction_store::TransactionFlow::new(
            "checkout",
            TransactionId::new("tx-1"),
            vec![
                TransactionStep::new("reserve", false, true),
                TransactionStep::new("charge", false, true),
                TransactionStep::new("ship", false, false),
            ],
        ),
        transaction_store::TransactionContext::new(json!({})),
    );
    transaction.flow.state = TransactionState::Invoking;
    transaction.flow.steps[0].state = StepState::Done;
    transaction.flow.steps[1].state = StepState::Invoking;
    h.storage.insert(&mut transaction).await.unwrap();

    let result = workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    assert!(!result.has_finished());
    assert!(h.services.calls().is_empty());
    assert_eq!(h.hooks.events(), vec!["resume"]);
}

#[tokio::test]
async fn timeout_rolls_back_expired_transaction() {
    let h = TestHarness::new();
    let workflow = StepWorkflow::builder("checkout")
        .step(h.reserve_step())
        .step(StepDefinition::new("confirm", |_| async { Ok(Value::Null) }).async_step())
        .timeout(Duration::from_millis(10))
        .build(h.storage.clone());

    let id = TransactionId::new("tx-1");
    workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;

    assert!(h.stored("tx-1").await.flow.timeout_at.is_some());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let result = workflow.timeout(&id, &h.hooks).await;
    assert!(result.thrown_error.is_none());

    let stored = h.stored("tx-1").await;
    assert!(stored.flow.timed_out);
    assert_eq!(stored.state(), TransactionState::Reverted);
    let events = h.hooks.events();
    let timeout_at = events.iter().position(|e| e == "timeout").unwrap();
    assert_eq!(events[timeout_at + 1], "compensate_begin");
    assert_eq!(events.last().unwrap(), "finish:reverted");
}

#[tokio::test]
async fn timeout_before_deadline_is_a_no_op() {
    let h = TestHarness::new();
    let workflow = StepWorkflow::builder("checkout")
        .step(StepDefinition::new("confirm", |_| async { Ok(Value::Null) }).async_step())
        .timeout(Duration::from_secs(3600))
        .build(h.storage.clone());

    workflow
        .run(
            json!({}),
            ExecutionContext::new().with_transaction_id("tx-1"),
            &h.hooks,
        )
        .await;
    let result = workflow
        .timeout(&TransactionId::new("tx-1"), &h.hooks)
        .await;

    assert!(!result.has_finished());
    assert!(!h.hooks.events().contains(&"timeout".to_string()));
}

#[tokio::test]
async fn parent_step_key_is_stored_in_metadata() {
    let h = TestHarness::new();
    let workflow = h.checkout();
    let parent = IdempotencyKey::invoke("order", "parent-tx", "checkout").unwrap();

    let result = workflow
        .run(
            json!({}),
            ExecutionContext::new()
                .with_transaction_id("tx-1")
                .with_parent_step(parent.clone())
                .with_event_group_id("group-1"),
            &h.hooks,
        )
        .await;

    let metadata = result.transaction.unwrap().flow.metadata;
    assert_eq!(metadata.parent_step_idempotency_key, Some(parent));
    assert_eq!(metadata.event_group_id.as_deref(), Some("group-1"));
}
