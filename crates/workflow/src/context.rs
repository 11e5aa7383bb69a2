//! The handle workflow code uses to request work.

use std::collections::{BTreeMap, HashMap};
use std::task::Poll;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::ExecutionKey;
use saga::CompensationRef;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::command::WorkflowCommand;
use crate::error::WorkflowError;
use crate::events::{ScheduledActivity, TimerRef};
use crate::failure::{ActivityFailure, WorkflowFailure};
use crate::options::{ActivityOptions, ChildWorkflowOptions, CompensationSpec};
use crate::state::{ActivityStatus, ChildStatus, ExecutionState};

/// Deterministic view of one execution, handed to workflow code on every pass.
///
/// Each call that requests work (`activity`, `timer`, `child_workflow`) takes
/// the next command id, so an id identifies a call by its position in the
/// code. If history already holds the outcome for that id the call returns
/// `Poll::Ready`; otherwise the request becomes a command (the first time)
/// and the call returns `Poll::Pending`. Use [`std::task::ready!`] to stop
/// at the first unresolved step:
///
/// ```ignore
/// let order = ready!(ctx.activity("ValidateOrder", input, ActivityOptions::default()))?;
/// ```
///
/// Time is read from history, never from the system clock.
pub struct WorkflowContext<'a> {
    state: &'a ExecutionState,
    last_command_id: u64,
    commands: Vec<WorkflowCommand>,
    signal_cursors: HashMap<String, usize>,
    exposed: BTreeMap<String, Value>,
    now: DateTime<Utc>,
    nondeterminism: Option<WorkflowError>,
}

/// What a pass over workflow code produced besides its poll result.
pub(crate) struct PassOutput {
    pub commands: Vec<WorkflowCommand>,
    pub exposed: BTreeMap<String, Value>,
    pub last_command_id: u64,
    pub nondeterminism: Option<WorkflowError>,
}

impl<'a> WorkflowContext<'a> {
    pub(crate) fn new(state: &'a ExecutionState) -> Self {
        Self {
            state,
            last_command_id: 0,
            commands: Vec::new(),
            signal_cursors: HashMap::new(),
            exposed: BTreeMap::new(),
            now: state.started_at(),
            nondeterminism: None,
        }
    }

    pub(crate) fn finish(self) -> PassOutput {
        PassOutput {
            commands: self.commands,
            exposed: self.exposed,
            last_command_id: self.last_command_id,
            nondeterminism: self.nondeterminism,
        }
    }

    /// Schedules an activity and returns its outcome once recorded.
    ///
    /// Transient failures are retried by the dispatcher; the code only sees
    /// the final result or an [`ActivityFailure`].
    pub fn activity(
        &mut self,
        name: &str,
        input: Value,
        options: ActivityOptions,
    ) -> Poll<Result<Value, ActivityFailure>> {
        self.schedule_activity(name, input, options, None)
    }

    /// Schedules a compensable activity.
    ///
    /// Once it completes, `compensation` is pushed onto the execution's
    /// compensation stack and runs if the workflow later fails.
    pub fn activity_with_compensation(
        &mut self,
        name: &str,
        input: Value,
        options: ActivityOptions,
        compensation: CompensationSpec,
    ) -> Poll<Result<Value, ActivityFailure>> {
        let compensation = compensation.bind(name, &input, &options.task_queue);
        self.schedule_activity(name, input, options, Some(compensation))
    }

    fn schedule_activity(
        &mut self,
        name: &str,
        input: Value,
        options: ActivityOptions,
        compensation: Option<CompensationRef>,
    ) -> Poll<Result<Value, ActivityFailure>> {
        let command_id = self.next_command_id();
        if self.nondeterminism.is_some() {
            return Poll::Pending;
        }

        let state = self.state;
        if let Some(record) = state.activities().get(&command_id) {
            if record.scheduled.activity_type != name {
                self.mismatch(
                    command_id,
                    format!(
                        "history has activity {} but code scheduled activity {name}",
                        record.scheduled.activity_type
                    ),
                );
                return Poll::Pending;
            }
            return match &record.status {
                ActivityStatus::Completed { result, .. } => {
                    self.observe(record.resolved_at);
                    Poll::Ready(Ok(result.clone()))
                }
                ActivityStatus::Failed { error, attempts } => {
                    self.observe(record.resolved_at);
                    Poll::Ready(Err(ActivityFailure {
                        activity_name: name.to_string(),
                        error: error.clone(),
                        attempts: *attempts,
                    }))
                }
                ActivityStatus::Scheduled { .. } | ActivityStatus::Retrying { .. } => Poll::Pending,
            };
        }

        if let Some(recorded) = self.recorded_kind(command_id) {
            self.mismatch(
                command_id,
                format!("history has {recorded} but code scheduled activity {name}"),
            );
            return Poll::Pending;
        }

        self.commands
            .push(WorkflowCommand::ScheduleActivity(ScheduledActivity {
                activity_id: command_id,
                activity_type: name.to_string(),
                input,
                options,
                compensation,
                compensates: None,
            }));
        Poll::Pending
    }

    /// Sleeps durably for `duration`.
    pub fn timer(&mut self, duration: Duration) -> Poll<()> {
        let timer_id = self.next_command_id();
        if self.nondeterminism.is_some() {
            return Poll::Pending;
        }

        let timer = TimerRef::Workflow { timer_id };
        let state = self.state;
        if let Some(record) = state.timer(&timer) {
            return match record.fired_at {
                Some(at) => {
                    self.observe(Some(at));
                    Poll::Ready(())
                }
                None => Poll::Pending,
            };
        }

        if let Some(recorded) = self.recorded_kind(timer_id) {
            self.mismatch(timer_id, format!("history has {recorded} but code started a timer"));
            return Poll::Pending;
        }

        self.commands
            .push(WorkflowCommand::StartTimer { timer, duration });
        Poll::Pending
    }

    /// Starts a child workflow and returns the result of its final run.
    pub fn child_workflow(
        &mut self,
        workflow_type: &str,
        workflow_id: impl Into<String>,
        input: Value,
        options: ChildWorkflowOptions,
    ) -> Poll<Result<Value, WorkflowFailure>> {
        self.start_child(workflow_type, workflow_id.into(), input, options, None)
    }

    /// Starts a child workflow whose completion pushes `compensation`.
    pub fn child_workflow_with_compensation(
        &mut self,
        workflow_type: &str,
        workflow_id: impl Into<String>,
        input: Value,
        options: ChildWorkflowOptions,
        compensation: CompensationSpec,
    ) -> Poll<Result<Value, WorkflowFailure>> {
        let compensation =
            compensation.bind(workflow_type, &input, crate::options::DEFAULT_TASK_QUEUE);
        self.start_child(
            workflow_type,
            workflow_id.into(),
            input,
            options,
            Some(compensation),
        )
    }

    fn start_child(
        &mut self,
        workflow_type: &str,
        workflow_id: String,
        input: Value,
        options: ChildWorkflowOptions,
        compensation: Option<CompensationRef>,
    ) -> Poll<Result<Value, WorkflowFailure>> {
        let child_id = self.next_command_id();
        if self.nondeterminism.is_some() {
            return Poll::Pending;
        }

        let state = self.state;
        if let Some(child) = state.children().get(&child_id) {
            if child.workflow_type != workflow_type {
                self.mismatch(
                    child_id,
                    format!(
                        "history has child workflow {} but code started {workflow_type}",
                        child.workflow_type
                    ),
                );
                return Poll::Pending;
            }
            return match &child.status {
                ChildStatus::Completed(result) => {
                    self.observe(child.resolved_at);
                    Poll::Ready(Ok(result.clone()))
                }
                ChildStatus::Failed(failure) => {
                    self.observe(child.resolved_at);
                    Poll::Ready(Err(failure.clone()))
                }
                ChildStatus::Running => Poll::Pending,
            };
        }

        if let Some(recorded) = self.recorded_kind(child_id) {
            self.mismatch(
                child_id,
                format!("history has {recorded} but code started child workflow {workflow_type}"),
            );
            return Poll::Pending;
        }

        self.commands.push(WorkflowCommand::StartChildWorkflow {
            child_id,
            workflow_type: workflow_type.to_string(),
            workflow_id,
            input,
            options,
            compensation,
        });
        Poll::Pending
    }

    /// Waits for a signal. The k-th call for a name consumes the k-th signal
    /// of that name.
    pub fn wait_for_signal(&mut self, name: &str) -> Poll<Value> {
        let cursor = self.signal_cursors.get(name).copied().unwrap_or(0);
        let state = self.state;
        let Some(signal) = state
            .signals()
            .iter()
            .filter(|signal| signal.name == name)
            .nth(cursor)
        else {
            return Poll::Pending;
        };

        self.signal_cursors.insert(name.to_string(), cursor + 1);
        self.observe(Some(signal.received_at));
        Poll::Ready(signal.payload.clone())
    }

    /// Every signal of `name` received so far, oldest first.
    pub fn signals(&self, name: &str) -> Vec<&'a Value> {
        let state = self.state;
        state
            .signals()
            .iter()
            .filter(|signal| signal.name == name)
            .map(|signal| &signal.payload)
            .collect()
    }

    /// Returns true once a cancellation request is recorded.
    pub fn is_cancel_requested(&self) -> bool {
        self.state.cancel_requested().is_some()
    }

    pub fn cancel_reason(&self) -> Option<&'a str> {
        let state = self.state;
        state.cancel_requested()
    }

    /// Publishes a value readable by queries under `name`.
    pub fn expose(&mut self, name: impl Into<String>, value: Value) {
        self.exposed.insert(name.into(), value);
    }

    /// Deterministic current time: the timestamp of the latest event the code consumed.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn input(&self) -> &'a Value {
        let state = self.state;
        state.input()
    }

    /// Decodes the workflow input.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, WorkflowFailure> {
        Ok(serde_json::from_value(self.state.input().clone())?)
    }

    /// Run attempt under workflow-level retry, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.state.attempt()
    }

    pub fn execution(&self) -> &'a ExecutionKey {
        let state = self.state;
        state.execution()
    }

    pub fn workflow_type(&self) -> &'a str {
        let state = self.state;
        state.workflow_type()
    }

    fn next_command_id(&mut self) -> u64 {
        self.last_command_id += 1;
        self.last_command_id
    }

    fn observe(&mut self, at: Option<DateTime<Utc>>) {
        if let Some(at) = at
            && at > self.now
        {
            self.now = at;
        }
    }

    fn recorded_kind(&self, command_id: u64) -> Option<&'static str> {
        if self.state.activities().contains_key(&command_id) {
            Some("an activity")
        } else if self.state.children().contains_key(&command_id) {
            Some("a child workflow")
        } else if self.state.timer_started(&TimerRef::Workflow {
            timer_id: command_id,
        }) {
            Some("a timer")
        } else if self.state.compensations().contains_key(&command_id) {
            Some("a compensation activity")
        } else {
            None
        }
    }

    fn mismatch(&mut self, command_id: u64, message: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(WorkflowError::Nondeterminism {
                command_id,
                message,
            });
        }
    }
}

impl std::fmt::Debug for WorkflowContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowContext")
            .field("execution", self.state.execution())
            .field("last_command_id", &self.last_command_id)
            .field("commands", &self.commands.len())
            .finish()
    }
}
