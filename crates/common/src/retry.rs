//! Retry policy shared by activities, compensations and workflow runs.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::failure::{ActivityError, ErrorClass};

/// Rejected retry policy parameters.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("initial interval must be greater than zero")]
    ZeroInitialInterval,

    #[error("backoff coefficient must be >= 1.0, got {0}")]
    InvalidBackoffCoefficient(f64),

    #[error("maximum interval {maximum:?} is shorter than initial interval {initial:?}")]
    MaximumBelowInitial { initial: Duration, maximum: Duration },
}

/// How a failed unit of work is retried.
///
/// A pure value: attached to an activity or a workflow at schedule time and
/// never mutated afterwards. `maximum_attempts == 0` means unlimited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
    /// Error kinds that are never retried. Ordered so that serialized
    /// commands are byte-identical across replays.
    #[serde(default)]
    pub non_retryable_error_kinds: BTreeSet<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(100),
            maximum_attempts: 0,
            non_retryable_error_kinds: BTreeSet::new(),
        }
    }
}

impl RetryPolicy {
    /// Default policy capped at `maximum_attempts`.
    pub fn new(maximum_attempts: u32) -> Self {
        Self {
            maximum_attempts,
            ..Self::default()
        }
    }

    /// A single attempt, no retries.
    pub fn no_retry() -> Self {
        Self::new(1)
    }

    /// Policy used for compensations unless the author overrides it.
    ///
    /// Compensations get more attempts than forward steps: a partial rollback
    /// is worse than a slow one.
    pub fn compensation() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(30),
            maximum_attempts: 10,
            non_retryable_error_kinds: BTreeSet::new(),
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = interval;
        self
    }

    pub fn with_maximum_attempts(mut self, attempts: u32) -> Self {
        self.maximum_attempts = attempts;
        self
    }

    /// Marks an error kind as non-retryable.
    pub fn non_retryable(mut self, kind: impl Into<String>) -> Self {
        self.non_retryable_error_kinds.insert(kind.into());
        self
    }

    /// Checks the policy parameters.
    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.initial_interval.is_zero() {
            return Err(RetryPolicyError::ZeroInitialInterval);
        }
        if self.backoff_coefficient.is_nan() || self.backoff_coefficient < 1.0 {
            return Err(RetryPolicyError::InvalidBackoffCoefficient(
                self.backoff_coefficient,
            ));
        }
        if self.maximum_interval < self.initial_interval {
            return Err(RetryPolicyError::MaximumBelowInitial {
                initial: self.initial_interval,
                maximum: self.maximum_interval,
            });
        }
        Ok(())
    }

    /// Returns true if another attempt may follow the given (1-based) attempt.
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        self.maximum_attempts == 0 || attempt < self.maximum_attempts
    }

    /// Backoff before the attempt that follows `attempt` failing:
    /// `min(initial * coefficient^(attempt - 1), maximum)`.
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let initial = self.initial_interval.as_secs_f64();
        let raw = initial * self.backoff_coefficient.max(1.0).powi(exponent);
        let cap = self.maximum_interval.as_secs_f64();

        if !raw.is_finite() || raw >= cap {
            self.maximum_interval
        } else {
            Duration::from_secs_f64(raw)
        }
    }

    /// Classifies an error once, at the dispatcher boundary.
    pub fn classify(&self, error: &ActivityError) -> ErrorClass {
        if error.non_retryable || self.non_retryable_error_kinds.contains(&error.kind) {
            ErrorClass::Permanent
        } else {
            ErrorClass::Transient
        }
    }
}
