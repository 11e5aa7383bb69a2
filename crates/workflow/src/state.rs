//! Execution state folded from history.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ActivityError, ExecutionKey, RetryPolicy, RunId};
use event_store::SequenceNo;
use saga::{CompensationRef, CompensationReport, CompensationStack, SagaEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WorkflowError};
use crate::events::{HistoryEvent, ParentLink, ScheduledActivity, TimerRef, UnwindCause, WorkflowEvent};
use crate::failure::WorkflowFailure;
use crate::options::ChildWorkflowOptions;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed => "Completed",
            ExecutionStatus::Failed => "Failed",
            ExecutionStatus::TimedOut => "TimedOut",
            ExecutionStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TerminalOutcome {
    Completed {
        result: Value,
    },
    Failed {
        failure: WorkflowFailure,
        next_run: Option<RunId>,
    },
    TimedOut {
        failure: WorkflowFailure,
    },
    Cancelled {
        reason: String,
        terminated: bool,
        compensation: Option<CompensationReport>,
    },
}

impl TerminalOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            TerminalOutcome::Completed { .. } => ExecutionStatus::Completed,
            TerminalOutcome::Failed { .. } => ExecutionStatus::Failed,
            TerminalOutcome::TimedOut { .. } => ExecutionStatus::TimedOut,
            TerminalOutcome::Cancelled { .. } => ExecutionStatus::Cancelled,
        }
    }
}

/// Dispatch state of an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActivityStatus {
    /// The given attempt is queued or running.
    Scheduled { attempt: u32 },
    /// Waiting on the backoff timer before `next_attempt`.
    Retrying {
        next_attempt: u32,
        last_error: ActivityError,
    },
    Completed { result: Value, attempts: u32 },
    Failed { error: ActivityError, attempts: u32 },
}

impl ActivityStatus {
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ActivityStatus::Completed { .. } | ActivityStatus::Failed { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub scheduled: ScheduledActivity,
    pub scheduled_at: DateTime<Utc>,
    pub status: ActivityStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerRecord {
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub fired_at: Option<DateTime<Utc>>,
}

impl TimerRecord {
    /// When the timer is due.
    pub fn deadline(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.duration)
            .ok()
            .and_then(|duration| self.started_at.checked_add_signed(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChildStatus {
    Running,
    Completed(Value),
    Failed(WorkflowFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub workflow_type: String,
    pub workflow_id: String,
    pub run_id: RunId,
    pub input: Value,
    pub options: ChildWorkflowOptions,
    pub compensation: Option<CompensationRef>,
    pub status: ChildStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ChildRecord {
    pub fn execution(&self) -> ExecutionKey {
        ExecutionKey::new(self.workflow_id.as_str(), self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub name: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Everything the engine knows about one run, derived by folding its history.
///
/// The fold is strict: events that cannot follow the current state are
/// reported as [`WorkflowError::CorruptHistory`] rather than skipped.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    execution: ExecutionKey,
    workflow_type: String,
    input: Value,
    attempt: u32,
    retry_policy: RetryPolicy,
    execution_timeout: Option<Duration>,
    start_delay: Option<Duration>,
    parent: Option<ParentLink>,
    previous_run: Option<RunId>,
    started_at: DateTime<Utc>,
    activities: BTreeMap<u64, ActivityRecord>,
    compensations: BTreeMap<u64, ActivityRecord>,
    timers: BTreeMap<TimerRef, TimerRecord>,
    children: BTreeMap<u64, ChildRecord>,
    signals: Vec<SignalRecord>,
    cancel_requested: Option<String>,
    unwind_cause: Option<UnwindCause>,
    saga: CompensationStack,
    outcome: Option<TerminalOutcome>,
    last_sequence: SequenceNo,
    closed_at: Option<DateTime<Utc>>,
}

impl ExecutionState {
    /// Folds a complete history, which must begin with `WorkflowStarted`.
    pub fn fold(execution: &ExecutionKey, history: &[HistoryEvent]) -> Result<Self> {
        let (first, rest) = history
            .split_first()
            .ok_or_else(|| WorkflowError::corrupt(format!("history of {execution} is empty")))?;

        let mut state = Self::started(execution, first)?;
        for event in rest {
            state.apply(event)?;
        }
        Ok(state)
    }

    fn started(execution: &ExecutionKey, first: &HistoryEvent) -> Result<Self> {
        let WorkflowEvent::WorkflowStarted {
            workflow_type,
            input,
            attempt,
            retry_policy,
            execution_timeout,
            start_delay,
            parent,
            previous_run,
        } = &first.event
        else {
            return Err(WorkflowError::corrupt(format!(
                "history of {execution} starts with {}",
                first.event.event_type()
            )));
        };

        Ok(Self {
            execution: execution.clone(),
            workflow_type: workflow_type.clone(),
            input: input.clone(),
            attempt: *attempt,
            retry_policy: retry_policy.clone(),
            execution_timeout: *execution_timeout,
            start_delay: *start_delay,
            parent: parent.clone(),
            previous_run: *previous_run,
            started_at: first.timestamp,
            activities: BTreeMap::new(),
            compensations: BTreeMap::new(),
            timers: BTreeMap::new(),
            children: BTreeMap::new(),
            signals: Vec::new(),
            cancel_requested: None,
            unwind_cause: None,
            saga: CompensationStack::new(),
            outcome: None,
            last_sequence: first.sequence,
            closed_at: None,
        })
    }

    /// Applies one event appended after the current state.
    pub fn apply(&mut self, event: &HistoryEvent) -> Result<()> {
        if event.sequence != self.last_sequence.next() {
            return Err(WorkflowError::corrupt(format!(
                "expected sequence {} but found {}",
                self.last_sequence.next(),
                event.sequence
            )));
        }
        if self.outcome.is_some() {
            return Err(WorkflowError::corrupt(format!(
                "{} recorded after the run closed",
                event.event.event_type()
            )));
        }

        let at = event.timestamp;
        match &event.event {
            WorkflowEvent::WorkflowStarted { .. } => {
                return Err(WorkflowError::corrupt("WorkflowStarted recorded twice"));
            }
            WorkflowEvent::ActivityScheduled(scheduled) => {
                self.schedule_activity(scheduled, at)?;
            }
            WorkflowEvent::ActivityAttemptFailed {
                activity_id,
                attempt,
                error,
                ..
            } => {
                let record = self.activity_mut(*activity_id)?;
                record.status = ActivityStatus::Retrying {
                    next_attempt: attempt + 1,
                    last_error: error.clone(),
                };
            }
            WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                attempt,
            } => {
                let record = self.activity_mut(*activity_id)?;
                record.status = ActivityStatus::Completed {
                    result: result.clone(),
                    attempts: *attempt,
                };
                record.resolved_at = Some(at);

                let saga_event = if self.compensations.contains_key(activity_id) {
                    SagaEvent::CompensationCompleted {
                        activity_id: *activity_id,
                        attempts: *attempt,
                    }
                } else {
                    SagaEvent::StepCompleted {
                        step_id: *activity_id,
                        result: result.clone(),
                    }
                };
                self.saga.apply(saga_event)?;
            }
            WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                attempts,
            } => {
                let record = self.activity_mut(*activity_id)?;
                record.status = ActivityStatus::Failed {
                    error: error.clone(),
                    attempts: *attempts,
                };
                record.resolved_at = Some(at);

                let saga_event = if self.compensations.contains_key(activity_id) {
                    SagaEvent::CompensationFailed {
                        activity_id: *activity_id,
                        error: error.clone(),
                        attempts: *attempts,
                    }
                } else {
                    SagaEvent::StepFailed {
                        step_id: *activity_id,
                    }
                };
                self.saga.apply(saga_event)?;
            }
            WorkflowEvent::TimerStarted { timer, duration } => {
                if self.timers.contains_key(timer) {
                    return Err(WorkflowError::corrupt(format!("{timer} started twice")));
                }
                self.timers.insert(
                    timer.clone(),
                    TimerRecord {
                        duration: *duration,
                        started_at: at,
                        fired_at: None,
                    },
                );
            }
            WorkflowEvent::TimerFired { timer } => {
                let record = self
                    .timers
                    .get_mut(timer)
                    .ok_or_else(|| WorkflowError::corrupt(format!("{timer} fired but never started")))?;
                record.fired_at = Some(at);

                if let TimerRef::ActivityRetry {
                    activity_id,
                    attempt,
                } = timer
                {
                    let attempt = *attempt;
                    self.activity_mut(*activity_id)?.status = ActivityStatus::Scheduled { attempt };
                }
            }
            WorkflowEvent::ChildWorkflowStarted {
                child_id,
                workflow_type,
                workflow_id,
                run_id,
                input,
                options,
                compensation,
            } => {
                self.ensure_unused_id(*child_id)?;
                if let Some(compensation) = compensation {
                    self.saga.apply(SagaEvent::CompensableStepScheduled {
                        step_id: *child_id,
                        compensation: compensation.clone(),
                    })?;
                }
                self.children.insert(
                    *child_id,
                    ChildRecord {
                        workflow_type: workflow_type.clone(),
                        workflow_id: workflow_id.clone(),
                        run_id: *run_id,
                        input: input.clone(),
                        options: options.clone(),
                        compensation: compensation.clone(),
                        status: ChildStatus::Running,
                        resolved_at: None,
                    },
                );
            }
            WorkflowEvent::ChildWorkflowCompleted { child_id, result } => {
                let child = self.child_mut(*child_id)?;
                child.status = ChildStatus::Completed(result.clone());
                child.resolved_at = Some(at);
                self.saga.apply(SagaEvent::StepCompleted {
                    step_id: *child_id,
                    result: result.clone(),
                })?;
            }
            WorkflowEvent::ChildWorkflowFailed { child_id, failure } => {
                let child = self.child_mut(*child_id)?;
                child.status = ChildStatus::Failed(failure.clone());
                child.resolved_at = Some(at);
                self.saga.apply(SagaEvent::StepFailed {
                    step_id: *child_id,
                })?;
            }
            WorkflowEvent::SignalReceived { name, payload } => {
                self.signals.push(SignalRecord {
                    name: name.clone(),
                    payload: payload.clone(),
                    received_at: at,
                });
            }
            WorkflowEvent::CancelRequested { reason } => {
                // Repeated requests keep the first reason
                if self.cancel_requested.is_none() {
                    self.cancel_requested = Some(reason.clone());
                }
            }
            WorkflowEvent::CompensationStarted { cause } => {
                self.saga.apply(SagaEvent::UnwindStarted {
                    reason: cause.to_string(),
                })?;
                self.unwind_cause = Some(cause.clone());
            }
            WorkflowEvent::WorkflowCompleted { result } => {
                self.close(
                    TerminalOutcome::Completed {
                        result: result.clone(),
                    },
                    at,
                );
            }
            WorkflowEvent::WorkflowFailed { failure, next_run } => {
                self.close(
                    TerminalOutcome::Failed {
                        failure: failure.clone(),
                        next_run: *next_run,
                    },
                    at,
                );
            }
            WorkflowEvent::WorkflowTimedOut { failure } => {
                self.close(
                    TerminalOutcome::TimedOut {
                        failure: failure.clone(),
                    },
                    at,
                );
            }
            WorkflowEvent::WorkflowCancelled {
                reason,
                terminated,
                compensation,
            } => {
                self.close(
                    TerminalOutcome::Cancelled {
                        reason: reason.clone(),
                        terminated: *terminated,
                        compensation: compensation.clone(),
                    },
                    at,
                );
            }
        }

        self.last_sequence = event.sequence;
        Ok(())
    }

    fn schedule_activity(&mut self, scheduled: &ScheduledActivity, at: DateTime<Utc>) -> Result<()> {
        let activity_id = scheduled.activity_id;
        self.ensure_unused_id(activity_id)?;

        let record = ActivityRecord {
            scheduled: scheduled.clone(),
            scheduled_at: at,
            status: ActivityStatus::Scheduled { attempt: 1 },
            resolved_at: None,
        };

        if let Some(index) = scheduled.compensates {
            self.saga.apply(SagaEvent::CompensationScheduled { index, activity_id })?;
            self.compensations.insert(activity_id, record);
        } else {
            if let Some(compensation) = &scheduled.compensation {
                self.saga.apply(SagaEvent::CompensableStepScheduled {
                    step_id: activity_id,
                    compensation: compensation.clone(),
                })?;
            }
            self.activities.insert(activity_id, record);
        }
        Ok(())
    }

    fn ensure_unused_id(&self, id: u64) -> Result<()> {
        let used = self.activities.contains_key(&id)
            || self.compensations.contains_key(&id)
            || self.children.contains_key(&id)
            || self.timers.contains_key(&TimerRef::Workflow { timer_id: id });
        if used {
            return Err(WorkflowError::corrupt(format!("command id {id} recorded twice")));
        }
        Ok(())
    }

    fn activity_mut(&mut self, activity_id: u64) -> Result<&mut ActivityRecord> {
        if let Some(record) = self.activities.get_mut(&activity_id) {
            return Ok(record);
        }
        self.compensations
            .get_mut(&activity_id)
            .ok_or_else(|| WorkflowError::corrupt(format!("unknown activity {activity_id}")))
    }

    fn child_mut(&mut self, child_id: u64) -> Result<&mut ChildRecord> {
        self.children
            .get_mut(&child_id)
            .ok_or_else(|| WorkflowError::corrupt(format!("unknown child workflow {child_id}")))
    }

    fn close(&mut self, outcome: TerminalOutcome, at: DateTime<Utc>) {
        self.outcome = Some(outcome);
        self.closed_at = Some(at);
    }
}

// Query methods
impl ExecutionState {
    pub fn execution(&self) -> &ExecutionKey {
        &self.execution
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout
    }

    pub fn start_delay(&self) -> Option<Duration> {
        self.start_delay
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn previous_run(&self) -> Option<RunId> {
        self.previous_run
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at
    }

    pub fn status(&self) -> ExecutionStatus {
        self.outcome
            .as_ref()
            .map_or(ExecutionStatus::Running, TerminalOutcome::status)
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&TerminalOutcome> {
        self.outcome.as_ref()
    }

    /// Sequence number of the last folded event; the expected sequence of the next append.
    pub fn last_sequence(&self) -> SequenceNo {
        self.last_sequence
    }

    /// Forward activities scheduled by workflow code, keyed by command id.
    pub fn activities(&self) -> &BTreeMap<u64, ActivityRecord> {
        &self.activities
    }

    /// Compensation activities scheduled by the unwind, keyed by activity id.
    pub fn compensations(&self) -> &BTreeMap<u64, ActivityRecord> {
        &self.compensations
    }

    /// Looks up any activity, forward or compensation.
    pub fn activity(&self, activity_id: u64) -> Option<&ActivityRecord> {
        self.activities
            .get(&activity_id)
            .or_else(|| self.compensations.get(&activity_id))
    }

    /// Activities that have not resolved yet, forward and compensation.
    pub fn open_activities(&self) -> impl Iterator<Item = (&u64, &ActivityRecord)> {
        self.activities
            .iter()
            .chain(self.compensations.iter())
            .filter(|(_, record)| !record.status.is_resolved())
    }

    pub fn timers(&self) -> &BTreeMap<TimerRef, TimerRecord> {
        &self.timers
    }

    pub fn timer(&self, timer: &TimerRef) -> Option<&TimerRecord> {
        self.timers.get(timer)
    }

    pub fn timer_started(&self, timer: &TimerRef) -> bool {
        self.timers.contains_key(timer)
    }

    pub fn timer_fired(&self, timer: &TimerRef) -> bool {
        self.timers
            .get(timer)
            .is_some_and(|record| record.fired_at.is_some())
    }

    /// Timers that were started and have not fired.
    pub fn pending_timers(&self) -> impl Iterator<Item = (&TimerRef, &TimerRecord)> {
        self.timers
            .iter()
            .filter(|(_, record)| record.fired_at.is_none())
    }

    pub fn children(&self) -> &BTreeMap<u64, ChildRecord> {
        &self.children
    }

    /// Children still running.
    pub fn open_children(&self) -> impl Iterator<Item = (&u64, &ChildRecord)> {
        self.children
            .iter()
            .filter(|(_, child)| matches!(child.status, ChildStatus::Running))
    }

    pub fn signals(&self) -> &[SignalRecord] {
        &self.signals
    }

    pub fn cancel_requested(&self) -> Option<&str> {
        self.cancel_requested.as_deref()
    }

    pub fn unwind_cause(&self) -> Option<&UnwindCause> {
        self.unwind_cause.as_ref()
    }

    pub fn compensation_stack(&self) -> &CompensationStack {
        &self.saga
    }

    /// Highest command id recorded for workflow code (activities, timers, children).
    pub fn max_forward_command_id(&self) -> u64 {
        let activities = self.activities.keys().next_back().copied().unwrap_or(0);
        let children = self.children.keys().next_back().copied().unwrap_or(0);
        let timers = self
            .timers
            .keys()
            .filter_map(|timer| match timer {
                TimerRef::Workflow { timer_id } => Some(*timer_id),
                _ => None,
            })
            .max()
            .unwrap_or(0);
        activities.max(children).max(timers)
    }

    /// The id the next engine-issued command takes; never collides with a recorded one.
    pub fn next_free_command_id(&self) -> u64 {
        let compensations = self.compensations.keys().next_back().copied().unwrap_or(0);
        self.max_forward_command_id().max(compensations) + 1
    }
}
