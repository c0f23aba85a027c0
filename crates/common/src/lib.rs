//! Shared identifiers for the workflow orchestrator.
//!
//! - [`TransactionId`] identifies one run of a workflow.
//! - [`IdempotencyKey`] addresses one step invocation or compensation.

pub mod idempotency;
pub mod types;

pub use idempotency::{IdempotencyKey, IdempotencyKeyError, KEY_DELIMITER, StepAction};
pub use types::TransactionId;
