//! Commands produced by a replay pass.

use std::time::Duration;

use saga::CompensationReport;
use serde::Serialize;
use serde_json::Value;

use crate::events::{ScheduledActivity, TimerRef, UnwindCause};
use crate::failure::WorkflowFailure;
use crate::options::ChildWorkflowOptions;

/// What a replay pass asks the runtime to do next.
///
/// Commands are pure data: the runtime turns them into history events,
/// appends them, and only then realizes their side effects. Two passes over
/// the same history produce byte-identical serialized command lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", content = "data")]
pub enum WorkflowCommand {
    ScheduleActivity(ScheduledActivity),

    StartTimer {
        timer: TimerRef,
        duration: Duration,
    },

    /// The runtime picks the child's run id when recording the command.
    StartChildWorkflow {
        child_id: u64,
        workflow_type: String,
        workflow_id: String,
        input: Value,
        options: ChildWorkflowOptions,
        compensation: Option<saga::CompensationRef>,
    },

    BeginCompensation {
        cause: UnwindCause,
    },

    CompleteWorkflow {
        result: Value,
    },

    /// The runtime decides whether workflow-level retry continues the execution.
    FailWorkflow {
        failure: WorkflowFailure,
    },

    CancelWorkflow {
        reason: String,
        compensation: Option<CompensationReport>,
    },

    TimeOutWorkflow {
        failure: WorkflowFailure,
    },
}

impl WorkflowCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowCommand::ScheduleActivity(_) => "ScheduleActivity",
            WorkflowCommand::StartTimer { .. } => "StartTimer",
            WorkflowCommand::StartChildWorkflow { .. } => "StartChildWorkflow",
            WorkflowCommand::BeginCompensation { .. } => "BeginCompensation",
            WorkflowCommand::CompleteWorkflow { .. } => "CompleteWorkflow",
            WorkflowCommand::FailWorkflow { .. } => "FailWorkflow",
            WorkflowCommand::CancelWorkflow { .. } => "CancelWorkflow",
            WorkflowCommand::TimeOutWorkflow { .. } => "TimeOutWorkflow",
        }
    }

    /// Returns true if the command closes the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowCommand::CompleteWorkflow { .. }
                | WorkflowCommand::FailWorkflow { .. }
                | WorkflowCommand::CancelWorkflow { .. }
                | WorkflowCommand::TimeOutWorkflow { .. }
        )
    }
}
