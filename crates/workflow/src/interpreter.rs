//! The deterministic replay interpreter.
//!
//! A pass folds nothing itself: it takes the [`ExecutionState`] folded from
//! history, re-runs the workflow code from the start against it and returns
//! the commands that are not yet reflected in history. Passes have no side
//! effects, so the runtime may discard one at any time (for instance after
//! losing an append race) and simply run another.

use std::task::Poll;

use saga::{CompensationReport, UnwindStep, next_step};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::command::WorkflowCommand;
use crate::context::WorkflowContext;
use crate::definition::{CancellationPolicy, WorkflowDefinition};
use crate::error::{Result, WorkflowError};
use crate::events::{HistoryEvent, ScheduledActivity, TimerRef, UnwindCause};
use crate::failure::WorkflowFailure;
use crate::options::ActivityOptions;
use crate::state::{ActivityStatus, ExecutionState};

/// Built-in query returning the run status.
pub const QUERY_STATUS: &str = "__status";
/// Built-in query returning the compensation stack.
pub const QUERY_COMPENSATION_STACK: &str = "__compensation_stack";
/// Built-in query returning the activities not resolved yet.
pub const QUERY_OPEN_ACTIVITIES: &str = "__open_activities";

/// Runs one pass of `definition` over `state` and returns the new commands.
///
/// Returns no commands once the run is terminal or while it is blocked on
/// something already requested.
#[instrument(skip(definition, state), fields(execution = %state.execution()))]
pub fn replay(
    definition: &dyn WorkflowDefinition,
    state: &ExecutionState,
) -> Result<Vec<WorkflowCommand>> {
    if state.is_terminal() {
        return Ok(Vec::new());
    }

    if let Some(delay) = state.start_delay()
        && !state.timer_fired(&TimerRef::StartDelay)
    {
        if state.timer_started(&TimerRef::StartDelay) {
            return Ok(Vec::new());
        }
        return Ok(vec![WorkflowCommand::StartTimer {
            timer: TimerRef::StartDelay,
            duration: delay,
        }]);
    }

    let mut commands = Vec::new();
    if let Some(timeout) = state.execution_timeout()
        && !state.timer_started(&TimerRef::ExecutionTimeout)
    {
        commands.push(WorkflowCommand::StartTimer {
            timer: TimerRef::ExecutionTimeout,
            duration: timeout,
        });
    }

    if let Some(cause) = state.unwind_cause() {
        commands.extend(continue_unwind(state, cause));
        return Ok(commands);
    }

    if state.timer_fired(&TimerRef::ExecutionTimeout) {
        debug!("execution timeout fired");
        commands.extend(begin_unwind(state, UnwindCause::TimedOut)?);
        return Ok(commands);
    }

    if let Some(reason) = state.cancel_requested() {
        match definition.cancellation_policy() {
            CancellationPolicy::Compensate => {
                let cause = UnwindCause::Cancelled {
                    reason: reason.to_string(),
                };
                commands.extend(begin_unwind(state, cause)?);
                return Ok(commands);
            }
            CancellationPolicy::CancelImmediately => {
                commands.push(WorkflowCommand::CancelWorkflow {
                    reason: reason.to_string(),
                    compensation: None,
                });
                return Ok(commands);
            }
            CancellationPolicy::Ignore => {}
        }
    }

    let mut ctx = WorkflowContext::new(state);
    let poll = definition.execute(&mut ctx);
    let pass = ctx.finish();
    if let Some(error) = pass.nondeterminism {
        return Err(error);
    }

    match poll {
        Poll::Ready(Ok(result)) => {
            // Requests issued alongside the final result are never awaited
            commands.push(WorkflowCommand::CompleteWorkflow { result });
        }
        Poll::Ready(Err(failure)) => {
            debug!(kind = %failure.kind, "workflow code failed");
            commands.extend(begin_unwind(state, UnwindCause::Failed(failure))?);
        }
        Poll::Pending => {
            let recorded = state.max_forward_command_id();
            if recorded > pass.last_command_id {
                return Err(WorkflowError::Nondeterminism {
                    command_id: pass.last_command_id + 1,
                    message: format!(
                        "history records commands up to {recorded} but the code blocked after {}",
                        pass.last_command_id
                    ),
                });
            }
            commands.extend(pass.commands);
        }
    }

    debug!(commands = commands.len(), "replay pass finished");
    Ok(commands)
}

/// Folds `history` and runs one pass over it.
pub fn replay_history(
    definition: &dyn WorkflowDefinition,
    execution: &common::ExecutionKey,
    history: &[HistoryEvent],
) -> Result<Vec<WorkflowCommand>> {
    let state = ExecutionState::fold(execution, history)?;
    replay(definition, &state)
}

/// Starts the single unwind of the run.
///
/// The first compensation (or the terminal command, if there is nothing to
/// undo) is issued in the same pass, computed against the stack as it will
/// be once `CompensationStarted` is recorded.
fn begin_unwind(state: &ExecutionState, cause: UnwindCause) -> Result<Vec<WorkflowCommand>> {
    let mut stack = state.compensation_stack().clone();
    stack.apply(saga::SagaEvent::UnwindStarted {
        reason: cause.to_string(),
    })?;

    let mut commands = vec![WorkflowCommand::BeginCompensation {
        cause: cause.clone(),
    }];
    commands.extend(unwind_command(state, &cause, next_step(&stack)));
    Ok(commands)
}

fn continue_unwind(state: &ExecutionState, cause: &UnwindCause) -> Option<WorkflowCommand> {
    unwind_command(state, cause, next_step(state.compensation_stack()))
}

fn unwind_command(
    state: &ExecutionState,
    cause: &UnwindCause,
    step: UnwindStep<'_>,
) -> Option<WorkflowCommand> {
    match step {
        UnwindStep::Schedule { index, entry } => {
            let compensation = &entry.compensation;
            debug!(
                step = %compensation.activity_name,
                compensation = %compensation.compensation_activity_name,
                "scheduling compensation"
            );
            Some(WorkflowCommand::ScheduleActivity(ScheduledActivity {
                activity_id: state.next_free_command_id(),
                activity_type: compensation.compensation_activity_name.clone(),
                input: entry.input.clone(),
                options: ActivityOptions::for_compensation(compensation),
                compensation: None,
                compensates: Some(index),
            }))
        }
        UnwindStep::Drained(report) => Some(terminal_command(cause, report)),
        UnwindStep::NotUnwinding | UnwindStep::Await { .. } | UnwindStep::AwaitStep { .. } => None,
    }
}

fn terminal_command(cause: &UnwindCause, report: CompensationReport) -> WorkflowCommand {
    let compensation = (report.total() > 0).then_some(report);
    match cause {
        UnwindCause::Failed(failure) => WorkflowCommand::FailWorkflow {
            failure: failure.clone().with_compensation(compensation),
        },
        UnwindCause::Cancelled { reason } => WorkflowCommand::CancelWorkflow {
            reason: reason.clone(),
            compensation,
        },
        UnwindCause::TimedOut => WorkflowCommand::TimeOutWorkflow {
            failure: WorkflowFailure::execution_timeout("workflow execution timed out")
                .with_compensation(compensation),
        },
    }
}

/// Answers a query from the current history without recording anything.
///
/// Built-in names are answered from the folded state; any other name is
/// looked up among the values the code publishes with
/// [`WorkflowContext::expose`] during a read-only pass.
pub fn query(
    definition: &dyn WorkflowDefinition,
    state: &ExecutionState,
    name: &str,
) -> Result<Option<Value>> {
    match name {
        QUERY_STATUS => Ok(Some(json!({
            "status": state.status(),
            "attempt": state.attempt(),
            "cancel_requested": state.cancel_requested().is_some(),
            "compensation_phase": state.compensation_stack().phase(),
        }))),
        QUERY_COMPENSATION_STACK => {
            let entries: Vec<Value> = state
                .compensation_stack()
                .entries()
                .iter()
                .map(|entry| {
                    json!({
                        "step": entry.compensation.activity_name,
                        "compensation": entry.compensation.compensation_activity_name,
                        "status": entry.status,
                    })
                })
                .collect();
            Ok(Some(Value::Array(entries)))
        }
        QUERY_OPEN_ACTIVITIES => {
            let open: Vec<Value> = state
                .open_activities()
                .map(|(activity_id, record)| {
                    let attempt = match &record.status {
                        ActivityStatus::Scheduled { attempt } => *attempt,
                        ActivityStatus::Retrying { next_attempt, .. } => *next_attempt,
                        ActivityStatus::Completed { attempts, .. }
                        | ActivityStatus::Failed { attempts, .. } => *attempts,
                    };
                    json!({
                        "activity_id": activity_id,
                        "activity_type": record.scheduled.activity_type,
                        "attempt": attempt,
                    })
                })
                .collect();
            Ok(Some(Value::Array(open)))
        }
        _ => {
            let mut ctx = WorkflowContext::new(state);
            let _ = definition.execute(&mut ctx);
            let mut pass = ctx.finish();
            if let Some(error) = pass.nondeterminism {
                return Err(error);
            }
            Ok(pass.exposed.remove(name))
        }
    }
}
