//! Workflow layer driven by the orchestrator.
//!
//! This crate provides:
//! - The `Workflow` trait, the contract every workflow definition fulfils
//! - `WorkflowEventHooks`, one callback per transaction lifecycle event
//! - `WorkflowRegistry` for looking workflows up by id
//! - `StepWorkflow`, a sequential engine with compensation and async steps

pub mod error;
pub mod hooks;
pub mod registry;
pub mod step;
pub mod step_workflow;
pub mod workflow;

pub use error::{Result, WorkflowError};
pub use hooks::{NoopHooks, WorkflowEventHooks};
pub use registry::WorkflowRegistry;
pub use step::{StepDefinition, StepFailure, StepFuture, StepHandler, StepInput};
pub use step_workflow::{StepWorkflow, StepWorkflowBuilder};
pub use workflow::{ExecutionContext, Workflow, WorkflowResult, final_response};
