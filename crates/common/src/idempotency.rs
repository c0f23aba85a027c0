//! Idempotency keys addressing a single step invocation or compensation.
//!
//! A key is the 4-tuple `(workflow_id, transaction_id, step_id, action)` and
//! is serialized as the colon-joined string `workflow:transaction:step:action`.
//! It is the only handle needed to deliver a step outcome later, e.g. from a
//! webhook callback or a finished sub-workflow.

use std::convert::Infallible;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TransactionId;

/// Separator between the parts of an encoded key.
pub const KEY_DELIMITER: char = ':';

/// Which handler of a step a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Invoke,
    Compensate,
}

impl StepAction {
    /// Returns the wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Invoke => "invoke",
            StepAction::Compensate => "compensate",
        }
    }
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepAction {
    type Err = IdempotencyKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invoke" => Ok(StepAction::Invoke),
            "compensate" => Ok(StepAction::Compensate),
            other => Err(IdempotencyKeyError::UnknownAction(other.to_string())),
        }
    }
}

/// Errors produced when building or decoding an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdempotencyKeyError {
    /// A part of the key was empty.
    #[error("Idempotency key part '{0}' must not be empty")]
    EmptyPart(&'static str),

    /// A part of the key contained the delimiter.
    #[error("Idempotency key part '{part}' must not contain ':': {value}")]
    DelimiterInPart { part: &'static str, value: String },

    /// The encoded key did not have exactly four parts.
    #[error("Malformed idempotency key '{0}': expected workflow:transaction:step:action")]
    Malformed(String),

    /// The action part was neither `invoke` nor `compensate`.
    #[error("Unknown step action '{0}'")]
    UnknownAction(String),
}

impl From<Infallible> for IdempotencyKeyError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// Composite key of a step invocation or compensation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey {
    workflow_id: String,
    transaction_id: TransactionId,
    step_id: String,
    action: StepAction,
}

impl IdempotencyKey {
    /// Builds a key, rejecting empty parts and parts containing the delimiter.
    pub fn new(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<TransactionId>,
        step_id: impl Into<String>,
        action: StepAction,
    ) -> Result<Self, IdempotencyKeyError> {
        let workflow_id = workflow_id.into();
        let transaction_id = transaction_id.into();
        let step_id = step_id.into();

        check_part("workflow_id", &workflow_id)?;
        check_part("transaction_id", transaction_id.as_str())?;
        check_part("step_id", &step_id)?;

        Ok(Self {
            workflow_id,
            transaction_id,
            step_id,
            action,
        })
    }

    /// Shorthand for an `invoke` key.
    pub fn invoke(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<TransactionId>,
        step_id: impl Into<String>,
    ) -> Result<Self, IdempotencyKeyError> {
        Self::new(workflow_id, transaction_id, step_id, StepAction::Invoke)
    }

    /// Shorthand for a `compensate` key.
    pub fn compensate(
        workflow_id: impl Into<String>,
        transaction_id: impl Into<TransactionId>,
        step_id: impl Into<String>,
    ) -> Result<Self, IdempotencyKeyError> {
        Self::new(workflow_id, transaction_id, step_id, StepAction::Compensate)
    }

    /// Encodes the key as `workflow:transaction:step:action`.
    pub fn encode(&self) -> String {
        format!(
            "{}{d}{}{d}{}{d}{}",
            self.workflow_id,
            self.transaction_id,
            self.step_id,
            self.action,
            d = KEY_DELIMITER
        )
    }

    /// Decodes a key previously produced by [`IdempotencyKey::encode`].
    pub fn decode(key: &str) -> Result<Self, IdempotencyKeyError> {
        let parts: Vec<&str> = key.split(KEY_DELIMITER).collect();
        let [workflow_id, transaction_id, step_id, action] = parts.as_slice() else {
            return Err(IdempotencyKeyError::Malformed(key.to_string()));
        };
        let action = action.parse()?;
        Self::new(*workflow_id, *transaction_id, *step_id, action)
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn action(&self) -> StepAction {
        self.action
    }
}

fn check_part(part: &'static str, value: &str) -> Result<(), IdempotencyKeyError> {
    if value.is_empty() {
        return Err(IdempotencyKeyError::EmptyPart(part));
    }
    if value.contains(KEY_DELIMITER) {
        return Err(IdempotencyKeyError::DelimiterInPart {
            part,
            value: value.to_string(),
        });
    }
    Ok(())
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for IdempotencyKey {
    type Err = IdempotencyKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl TryFrom<&str> for IdempotencyKey {
    type Error = IdempotencyKeyError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::decode(value)
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = IdempotencyKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

impl From<&IdempotencyKey> for IdempotencyKey {
    fn from(value: &IdempotencyKey) -> Self {
        value.clone()
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.encode()
    }
}
