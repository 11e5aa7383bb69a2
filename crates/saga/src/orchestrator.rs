//! Decides the next unwind action for a compensation stack.

use crate::report::CompensationReport;
use crate::stack::{CompensationStack, StackEntry};
use crate::state::SagaPhase;

/// What the unwind needs next.
#[derive(Debug, Clone, PartialEq)]
pub enum UnwindStep<'a> {
    /// Unwinding has not started.
    NotUnwinding,

    /// Schedule the compensation for stack entry `index`.
    Schedule { index: usize, entry: &'a StackEntry },

    /// A compensation is in flight; nothing to do until its outcome is recorded.
    Await { index: usize, activity_id: u64 },

    /// A compensable forward step is still running. It is pushed if it
    /// completes, so the unwind cannot finish before it resolves.
    AwaitStep { step_id: u64 },

    /// Every compensation reached a terminal outcome.
    Drained(CompensationReport),
}

/// Returns the next unwind step for the stack.
///
/// The stack is unwound top first and strictly one entry at a time: the
/// next entry is offered only after the previous compensation reached a
/// terminal outcome. Compensable steps still in flight resolve first, so a
/// late completion lands on top of the stack. A failed compensation does
/// not stop the unwind.
pub fn next_step(stack: &CompensationStack) -> UnwindStep<'_> {
    match stack.phase() {
        SagaPhase::Idle => UnwindStep::NotUnwinding,
        SagaPhase::Drained => UnwindStep::Drained(stack.report()),
        SagaPhase::Unwinding => {
            if let Some((index, activity_id)) = stack.in_flight() {
                return UnwindStep::Await { index, activity_id };
            }
            if let Some(step_id) = stack.first_pending_step() {
                return UnwindStep::AwaitStep { step_id };
            }
            match stack.next_unscheduled() {
                Some((index, entry)) => UnwindStep::Schedule { index, entry },
                None => UnwindStep::Drained(stack.report()),
            }
        }
    }
}
