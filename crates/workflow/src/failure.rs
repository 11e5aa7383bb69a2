//! Failures seen by workflow authors and by operators.

use common::ActivityError;
use saga::{CompensationReport, SagaError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure kind recorded when the execution timeout elapses.
pub const WORKFLOW_EXECUTION_TIMEOUT: &str = "WORKFLOW_EXECUTION_TIMEOUT";

/// Failure kind used when workflow input or an activity result does not decode.
pub const SERIALIZATION_ERROR: &str = "SERIALIZATION_ERROR";

/// Failure kind used for failures raised by workflow code without a kind.
pub const WORKFLOW_ERROR: &str = "WORKFLOW_ERROR";

/// An activity that failed for good, as handed to workflow code.
///
/// Transient failures never show up here: they are retried by the
/// dispatcher until the retry policy is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("activity {activity_name} failed after {attempts} attempt(s): {error}")]
pub struct ActivityFailure {
    pub activity_name: String,
    pub error: ActivityError,
    pub attempts: u32,
}

impl ActivityFailure {
    /// Returns the error kind reported by the last attempt.
    pub fn kind(&self) -> &str {
        &self.error.kind
    }
}

/// Terminal failure of a workflow run.
///
/// Carries the failing step and attempt count, free-form details chosen by
/// the workflow author, and once an unwind ran, the compensation report.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct WorkflowFailure {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub details: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationReport>,
}

impl WorkflowFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            step: None,
            attempts: 0,
            details: Value::Null,
            compensation: None,
        }
    }

    /// A failure with the generic workflow kind.
    pub fn message(message: impl Into<String>) -> Self {
        Self::new(WORKFLOW_ERROR, message)
    }

    pub fn execution_timeout(message: impl Into<String>) -> Self {
        Self::new(WORKFLOW_EXECUTION_TIMEOUT, message)
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_compensation(mut self, report: Option<CompensationReport>) -> Self {
        self.compensation = report;
        self
    }

    /// Reads `details.status`, the business status most workflows attach.
    pub fn status(&self) -> Option<&str> {
        self.details.get("status").and_then(Value::as_str)
    }

    /// Returns true if an unwind ran and some compensation failed.
    pub fn compensation_incomplete(&self) -> bool {
        self.compensation
            .as_ref()
            .is_some_and(|report| !report.is_complete())
    }

    /// Fails with `CompensationIncomplete` if the unwind left side effects behind.
    pub fn ensure_compensated(&self) -> Result<(), SagaError> {
        match &self.compensation {
            Some(report) => report.ensure_complete(),
            None => Ok(()),
        }
    }
}

impl From<ActivityFailure> for WorkflowFailure {
    fn from(failure: ActivityFailure) -> Self {
        WorkflowFailure::new(failure.error.kind.clone(), failure.error.message.clone())
            .with_step(failure.activity_name)
            .with_attempts(failure.attempts)
    }
}

impl From<serde_json::Error> for WorkflowFailure {
    fn from(e: serde_json::Error) -> Self {
        WorkflowFailure::new(SERIALIZATION_ERROR, e.to_string())
    }
}
