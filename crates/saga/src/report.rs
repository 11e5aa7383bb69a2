//! Operator-visible outcome of an unwind.

use common::ActivityError;
use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// Terminal outcome of one compensation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationOutcome {
    /// Forward step that was undone.
    pub step: String,
    /// Compensation activity that ran.
    pub compensation_activity: String,
    /// Attempts the compensation activity took.
    pub attempts: u32,
    /// Final error, set only for failed compensations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActivityError>,
}

/// What a finished unwind did, in execution order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompensationReport {
    pub compensated: Vec<CompensationOutcome>,
    pub failed: Vec<CompensationOutcome>,
}

impl CompensationReport {
    /// Returns true if every compensation succeeded (or there was nothing to undo).
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total number of compensations that ran.
    pub fn total(&self) -> usize {
        self.compensated.len() + self.failed.len()
    }

    /// Fails with `CompensationIncomplete` if any compensation failed.
    pub fn ensure_complete(&self) -> Result<(), SagaError> {
        if self.is_complete() {
            return Ok(());
        }

        let steps = self
            .failed
            .iter()
            .map(|o| format!("{} via {}", o.step, o.compensation_activity))
            .collect::<Vec<_>>()
            .join(", ");

        Err(SagaError::CompensationIncomplete {
            failed: self.failed.len(),
            total: self.total(),
            steps,
        })
    }
}
