//! Saga error types.

use thiserror::Error;

use crate::state::SagaPhase;

/// Errors that can occur while folding or unwinding a compensation stack.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SagaError {
    /// The stack is in the wrong phase for the event or operation.
    #[error("Invalid saga phase for {operation}: {actual}")]
    InvalidPhase {
        operation: &'static str,
        actual: SagaPhase,
    },

    /// A compensation was recorded for a stack entry that does not exist.
    #[error("Unknown compensation stack entry {0}")]
    UnknownEntry(usize),

    /// An outcome was recorded for an activity that is not the in-flight compensation.
    #[error("Activity {0} is not an in-flight compensation")]
    UnknownCompensation(u64),

    /// A stack entry was scheduled twice.
    #[error("Compensation for stack entry {0} was already scheduled")]
    AlreadyScheduled(usize),

    /// Best-effort rollback finished but some compensations failed.
    #[error("Compensation incomplete: {failed} of {total} compensations failed ({steps})")]
    CompensationIncomplete {
        failed: usize,
        total: usize,
        steps: String,
    },
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
