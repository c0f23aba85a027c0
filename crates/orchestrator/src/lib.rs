//! Workflow orchestrator service.
//!
//! This crate provides:
//! - `WorkflowOrchestrator`, the façade that runs and cancels workflows,
//!   registers async step outcomes and propagates child outcomes to parent steps
//! - `NotificationHub` and `SubscriberRegistry` for lifecycle notifications
//! - Pub/sub transports (in-process and PostgreSQL LISTEN/NOTIFY) for
//!   sharing notifications between orchestrator instances

pub mod config;
pub mod error;
pub mod events;
pub mod hooks;
pub mod notifier;
pub mod orchestrator;
pub mod subscribers;
pub mod transport;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use events::{NotificationEvent, NotificationEventType, TransportEnvelope};
pub use hooks::{FinishedTransaction, OrchestratorHooks};
pub use notifier::NotificationHub;
pub use orchestrator::{
    Acknowledgement, CancelOptions, RunOptions, StepResponseOptions, WorkflowOrchestrator,
    WorkflowRef, WorkflowRunResult,
};
pub use subscribers::{
    EventSubscriber, Registration, SubscribeOptions, SubscriberError, SubscriberId,
    SubscriberRef, SubscriberRegistry, UnsubscribeOptions, subscriber_fn,
};
pub use transport::{
    InMemoryBroker, InMemoryPubSub, PgPubSub, PubSubTransport, TransportError, TransportMessage,
};
