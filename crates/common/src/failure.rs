//! Activity error values and their retry classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error kind reported when an activity exceeds its start-to-close or
/// schedule-to-close timeout.
pub const ACTIVITY_TIMEOUT: &str = "ACTIVITY_TIMEOUT";

/// Error kind reported when a running activity stops heartbeating.
pub const HEARTBEAT_TIMEOUT: &str = "HEARTBEAT_TIMEOUT";

/// Error kind reported when no worker implementation is registered for an activity name.
pub const UNREGISTERED_ACTIVITY: &str = "UNREGISTERED_ACTIVITY";

/// Error kind used when an activity returns an error without naming a kind.
pub const GENERIC_ERROR: &str = "GENERIC_ERROR";

/// Error returned by an activity implementation or synthesized by the engine.
///
/// `kind` is matched against a retry policy's non-retryable kinds; the
/// `non_retryable` flag lets the activity itself declare the failure permanent
/// regardless of policy.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ActivityError {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub non_retryable: bool,
}

impl ActivityError {
    /// An error the retry policy decides about.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            non_retryable: false,
        }
    }

    /// A retryable error with the generic kind.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(GENERIC_ERROR, message)
    }

    /// An error that must never be retried, whatever the policy says.
    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            non_retryable: true,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ACTIVITY_TIMEOUT, message)
    }

    pub fn heartbeat_timeout(message: impl Into<String>) -> Self {
        Self::new(HEARTBEAT_TIMEOUT, message)
    }

    pub fn unregistered(activity_name: &str) -> Self {
        Self::permanent(
            UNREGISTERED_ACTIVITY,
            format!("no worker registered for activity '{activity_name}'"),
        )
    }
}

/// Outcome of classifying an [`ActivityError`] against a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// May be retried if attempts remain.
    Transient,
    /// Surfaces immediately, no further attempts.
    Permanent,
}
