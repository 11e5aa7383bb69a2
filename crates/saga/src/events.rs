//! Facts the compensation stack is folded from.
//!
//! These are not stored on their own: the workflow history is the only
//! durable record, and the workflow crate maps its history events onto
//! these when rebuilding an execution's state.

use common::ActivityError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compensation::CompensationRef;

/// Events that can change a compensation stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// A forward step carrying a compensation was scheduled.
    CompensableStepScheduled {
        step_id: u64,
        compensation: CompensationRef,
    },

    /// A forward step completed; pushes its compensation if it had one.
    StepCompleted { step_id: u64, result: Value },

    /// A forward step failed; its compensation is never pushed.
    StepFailed { step_id: u64 },

    /// The workflow decided to roll back. Happens at most once.
    UnwindStarted { reason: String },

    /// The compensation for stack entry `index` was scheduled as an activity.
    CompensationScheduled { index: usize, activity_id: u64 },

    /// A compensation activity completed.
    CompensationCompleted { activity_id: u64, attempts: u32 },

    /// A compensation activity exhausted its retries.
    CompensationFailed {
        activity_id: u64,
        error: ActivityError,
        attempts: u32,
    },
}

impl SagaEvent {
    /// Returns the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::CompensableStepScheduled { .. } => "CompensableStepScheduled",
            SagaEvent::StepCompleted { .. } => "StepCompleted",
            SagaEvent::StepFailed { .. } => "StepFailed",
            SagaEvent::UnwindStarted { .. } => "UnwindStarted",
            SagaEvent::CompensationScheduled { .. } => "CompensationScheduled",
            SagaEvent::CompensationCompleted { .. } => "CompensationCompleted",
            SagaEvent::CompensationFailed { .. } => "CompensationFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type() {
        assert_eq!(
            SagaEvent::StepCompleted {
                step_id: 1,
                result: json!(null)
            }
            .event_type(),
            "StepCompleted"
        );
        assert_eq!(
            SagaEvent::UnwindStarted {
                reason: "inventory_failed".into()
            }
            .event_type(),
            "UnwindStarted"
        );
        assert_eq!(
            SagaEvent::CompensationFailed {
                activity_id: 9,
                error: ActivityError::transient("down"),
                attempts: 10
            }
            .event_type(),
            "CompensationFailed"
        );
    }
}
