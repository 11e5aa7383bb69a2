//! Deterministic workflow execution core.
//!
//! This crate provides:
//! - History events and the [`ExecutionState`] folded from them
//! - [`WorkflowContext`], the deterministic handle workflow code runs against
//! - [`WorkflowDefinition`] and the [`WorkflowRegistry`]
//! - The replay interpreter turning history into [`WorkflowCommand`]s
//!
//! Workflow code is an ordinary function re-run from the start on every
//! pass. Each request it makes is identified by its position in the code,
//! so a pass over a longer history simply gets further before it blocks.

pub mod command;
pub mod context;
pub mod definition;
pub mod error;
pub mod events;
pub mod failure;
pub mod interpreter;
pub mod options;
pub mod state;

pub use command::WorkflowCommand;
pub use context::WorkflowContext;
pub use definition::{
    CancellationPolicy, FnWorkflow, WorkflowDefinition, WorkflowRegistry, WorkflowResult,
};
pub use error::{Result, WorkflowError};
pub use events::{HistoryEvent, ParentLink, ScheduledActivity, TimerRef, UnwindCause, WorkflowEvent};
pub use failure::{ActivityFailure, WORKFLOW_EXECUTION_TIMEOUT, WorkflowFailure};
pub use interpreter::{
    QUERY_COMPENSATION_STACK, QUERY_OPEN_ACTIVITIES, QUERY_STATUS, query, replay, replay_history,
};
pub use options::{
    ActivityOptions, ChildWorkflowOptions, CompensationSpec, DEFAULT_TASK_QUEUE, ParentClosePolicy,
};
pub use state::{
    ActivityRecord, ActivityStatus, ChildRecord, ChildStatus, ExecutionState, ExecutionStatus,
    SignalRecord, TerminalOutcome, TimerRecord,
};
