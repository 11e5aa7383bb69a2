//! The workflow driver.
//!
//! Every change to an execution goes through [`Engine::transact`]: under the
//! execution's lock it folds the current history, lets a closure decide what
//! to append, and appends it guarded by the expected last sequence. Losing
//! the race re-reads and retries. Side effects (queueing activities, arming
//! timers, starting runs) are realized only after the append succeeded and
//! the lock was released.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ActivityError, ErrorClass, ExecutionKey, RetryPolicy, RunId};
use event_store::{AppendOptions, EventStoreExt, SequenceNo};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use workflow::{
    ExecutionState, HistoryEvent, ParentClosePolicy, ParentLink, TerminalOutcome, TimerRef,
    WorkflowCommand, WorkflowEvent, WorkflowFailure,
};

use crate::error::{Result, RuntimeError};
use crate::runtime::Engine;
use crate::task::{ActivityTask, deadline_after};

/// Failure kind reported to a parent whose child was cancelled.
pub const CHILD_CANCELLED: &str = "CANCELLED";
/// Failure kind reported to a parent whose child was terminated.
pub const CHILD_TERMINATED: &str = "TERMINATED";

const PARENT_CLOSED: &str = "parent execution closed";

/// A side effect realized once the events that justify it are durable.
#[derive(Debug, Clone)]
pub(crate) enum Effect {
    EnqueueActivity(ActivityTask),
    ArmTimer {
        timer: TimerRef,
        deadline: DateTime<Utc>,
    },
    StartRun(StartRequest),
}

/// Events to append and the effects they unlock.
#[derive(Debug, Default)]
pub(crate) struct Planned {
    pub events: Vec<WorkflowEvent>,
    pub effects: Vec<Effect>,
}

impl Planned {
    pub fn event(mut self, event: WorkflowEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

/// A successful append: the state after it and the effects to realize.
#[derive(Debug)]
pub(crate) struct Committed {
    pub state: ExecutionState,
    pub effects: Vec<Effect>,
}

/// The first event of a run.
#[derive(Debug, Clone)]
pub(crate) struct StartRequest {
    pub execution: ExecutionKey,
    pub workflow_type: String,
    pub input: Value,
    pub attempt: u32,
    pub retry_policy: RetryPolicy,
    pub execution_timeout: Option<Duration>,
    pub start_delay: Option<Duration>,
    pub parent: Option<ParentLink>,
    pub previous_run: Option<RunId>,
}

impl StartRequest {
    fn started_event(&self) -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            workflow_type: self.workflow_type.clone(),
            input: self.input.clone(),
            attempt: self.attempt,
            retry_policy: self.retry_policy.clone(),
            execution_timeout: self.execution_timeout,
            start_delay: self.start_delay,
            parent: self.parent.clone(),
            previous_run: self.previous_run,
        }
    }
}

/// Follow-up work owed once a run closed.
#[derive(Debug, Clone)]
enum CloseAction {
    StartNextRun(StartRequest),
    ReportToParent {
        parent: ParentLink,
        result: std::result::Result<Value, WorkflowFailure>,
    },
    CloseChild {
        child: ExecutionKey,
        policy: ParentClosePolicy,
    },
}

impl Engine {
    pub(crate) async fn load_history(&self, execution: &ExecutionKey) -> Result<Vec<HistoryEvent>> {
        let envelopes = self.store.read_history(execution).await?;
        Ok(HistoryEvent::from_envelopes(&envelopes)?)
    }

    /// Folds the execution's history; `None` if it has none.
    pub(crate) async fn load_state(&self, execution: &ExecutionKey) -> Result<Option<ExecutionState>> {
        let history = self.load_history(execution).await?;
        if history.is_empty() {
            return Ok(None);
        }
        Ok(Some(ExecutionState::fold(execution, &history)?))
    }

    /// Follows workflow-level retry links to the latest run that exists.
    pub(crate) async fn latest_run(&self, execution: &ExecutionKey) -> Result<Option<ExecutionState>> {
        let Some(mut state) = self.load_state(execution).await? else {
            return Ok(None);
        };
        while let Some(TerminalOutcome::Failed {
            next_run: Some(run_id),
            ..
        }) = state.outcome()
        {
            let next = ExecutionKey::new(state.execution().workflow_id.clone(), *run_id);
            match self.load_state(&next).await? {
                Some(next_state) => state = next_state,
                None => break,
            }
        }
        Ok(Some(state))
    }

    async fn execution_lock(&self, execution: &ExecutionKey) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(execution.clone())
            .or_default()
            .clone()
    }

    async fn append(
        &self,
        state: &ExecutionState,
        events: Vec<WorkflowEvent>,
        now: DateTime<Utc>,
    ) -> Result<Vec<HistoryEvent>> {
        let expected = state.last_sequence();
        let mut sequence = expected;
        let history: Vec<HistoryEvent> = events
            .into_iter()
            .map(|event| {
                sequence = sequence.next();
                HistoryEvent::new(sequence, now, event)
            })
            .collect();

        let envelopes = history
            .iter()
            .map(|event| event.to_envelope(state.execution()))
            .collect::<workflow::Result<Vec<_>>>()?;
        self.store
            .append(envelopes, AppendOptions::expect_sequence(expected))
            .await?;
        Ok(history)
    }

    /// Appends what `build` decides against the current state of `execution`.
    ///
    /// Nothing is appended to a closed run or when `build` returns `None`.
    /// A conflicting append re-reads history and calls `build` again, up to
    /// `max_append_retries` times.
    pub(crate) async fn transact<F>(&self, execution: &ExecutionKey, mut build: F) -> Result<Option<Committed>>
    where
        F: FnMut(&ExecutionState, DateTime<Utc>) -> Result<Option<Planned>>,
    {
        let lock = self.execution_lock(execution).await;
        let _guard = lock.lock().await;

        let mut conflicts = 0;
        loop {
            let state = self
                .load_state(execution)
                .await?
                .ok_or_else(|| RuntimeError::NotFound(execution.clone()))?;
            if state.is_terminal() {
                return Ok(None);
            }

            let now = Utc::now();
            let Some(planned) = build(&state, now)? else {
                return Ok(None);
            };
            if planned.events.is_empty() {
                return Ok(None);
            }

            match self.append(&state, planned.events, now).await {
                Ok(appended) => {
                    let mut state = state;
                    for event in &appended {
                        state.apply(event)?;
                    }
                    return Ok(Some(Committed {
                        state,
                        effects: planned.effects,
                    }));
                }
                Err(err) if err.is_conflict() => {
                    conflicts += 1;
                    metrics::counter!("workflow_append_conflicts_total").increment(1);
                    if conflicts > self.options.max_append_retries {
                        return Err(RuntimeError::AppendContention {
                            execution: execution.clone(),
                            attempts: conflicts,
                        });
                    }
                    debug!(execution = %execution, conflicts, "append lost a race, retrying with fresh history");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Records an external fact (activity outcome, timer, signal, cancel)
    /// and schedules a pass. Returns false if nothing was appended.
    pub(crate) async fn record<F>(&self, execution: &ExecutionKey, build: F) -> Result<bool>
    where
        F: FnMut(&ExecutionState, DateTime<Utc>) -> Result<Option<Planned>>,
    {
        match self.transact(execution, build).await? {
            Some(committed) => {
                self.realize(committed).await;
                self.workflow_queue.push(execution.clone()).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Runs one workflow pass and records the commands it produced.
    #[instrument(skip(self), fields(execution = %execution))]
    pub(crate) async fn drive(&self, execution: &ExecutionKey) -> Result<()> {
        let started = std::time::Instant::now();
        let committed = self
            .transact(execution, |state: &ExecutionState, now| {
                let definition = self.workflows.get(state.workflow_type())?;
                let commands = workflow::replay(definition.as_ref(), state)?;
                if commands.is_empty() {
                    return Ok(None);
                }
                Ok(Some(plan(state, commands, now)))
            })
            .await;
        metrics::histogram!("workflow_pass_duration_seconds").record(started.elapsed().as_secs_f64());

        if let Some(committed) = committed? {
            self.realize(committed).await;
        }
        Ok(())
    }

    pub(crate) async fn fire_timer(&self, execution: &ExecutionKey, timer: &TimerRef) -> Result<bool> {
        self.record(execution, |state: &ExecutionState, _now| {
            if !state.timer_started(timer) || state.timer_fired(timer) {
                return Ok(None);
            }
            let mut planned = Planned::default().event(WorkflowEvent::TimerFired {
                timer: timer.clone(),
            });
            if let TimerRef::ActivityRetry {
                activity_id,
                attempt,
            } = timer
                && let Some(record) = state.activity(*activity_id)
                && !record.status.is_resolved()
            {
                planned = planned.effect(Effect::EnqueueActivity(ActivityTask::from_record(
                    state.execution(),
                    record,
                    *attempt,
                )));
            }
            Ok(Some(planned))
        })
        .await
    }

    /// Appends the first event of a new run and schedules its first pass.
    ///
    /// Starting a run that already exists is a no-op, so recovery can
    /// replay interrupted starts.
    pub(crate) async fn start_run(&self, request: StartRequest) -> Result<()> {
        let event = HistoryEvent::new(SequenceNo::first(), Utc::now(), request.started_event());
        let envelope = event.to_envelope(&request.execution)?;
        match self
            .store
            .append_event(envelope, AppendOptions::expect_new())
            .await
        {
            Ok(_) => {
                metrics::counter!("workflow_started_total").increment(1);
                info!(
                    execution = %request.execution,
                    workflow_type = %request.workflow_type,
                    attempt = request.attempt,
                    "workflow run started"
                );
            }
            Err(err) if err.is_conflict() => {
                if !self.store.execution_exists(&request.execution).await? {
                    return Err(err.into());
                }
                debug!(execution = %request.execution, "run already started");
            }
            Err(err) => return Err(err.into()),
        }
        self.workflow_queue.push(request.execution).await;
        Ok(())
    }

    /// Realizes the effects of a commit, then the close actions of every
    /// run that the commit (transitively) closed.
    pub(crate) async fn realize(&self, committed: Committed) {
        let mut pending = VecDeque::from([(committed, false)]);
        while let Some((Committed { state, effects }, wake)) = pending.pop_front() {
            let execution = state.execution().clone();
            for effect in effects {
                match effect {
                    Effect::EnqueueActivity(task) => self.activity_queues.push(task).await,
                    Effect::ArmTimer { timer, deadline } => {
                        self.timers.arm(execution.clone(), timer, deadline)
                    }
                    Effect::StartRun(request) => {
                        if let Err(err) = self.start_run(request).await {
                            warn!(execution = %execution, error = %err, "failed to start run");
                        }
                    }
                }
            }
            if wake {
                self.workflow_queue.push(execution.clone()).await;
            }

            if state.is_terminal() {
                self.on_closed(&state).await;
                for next in self.run_close_actions(&state).await {
                    pending.push_back((next, true));
                }
            }
        }
    }

    async fn on_closed(&self, state: &ExecutionState) {
        let status = state.status();
        metrics::counter!("workflow_closed_total", "status" => status.as_str()).increment(1);
        info!(execution = %state.execution(), status = %status, "workflow run closed");
        self.locks.lock().await.remove(state.execution());
        self.closed.send_modify(|closed| *closed += 1);
    }

    /// Carries out what a closed run still owes: the next retry run, the
    /// report to its parent and its parent close policy. Every action is
    /// idempotent, so it is safe to repeat after a crash.
    pub(crate) async fn run_close_actions(&self, state: &ExecutionState) -> Vec<Committed> {
        let mut committed = Vec::new();
        for action in close_actions(state) {
            match self.apply_close_action(action).await {
                Ok(Some(next)) => committed.push(next),
                Ok(None) => {}
                Err(RuntimeError::NotFound(execution)) => {
                    debug!(execution = %execution, "close action target no longer exists");
                }
                Err(err) => {
                    warn!(execution = %state.execution(), error = %err, "close action failed");
                }
            }
        }
        committed
    }

    async fn apply_close_action(&self, action: CloseAction) -> Result<Option<Committed>> {
        match action {
            CloseAction::StartNextRun(request) => {
                self.start_run(request).await?;
                Ok(None)
            }
            CloseAction::ReportToParent { parent, result } => {
                let child_id = parent.child_id;
                self.transact(&parent.execution, |state: &ExecutionState, _now| {
                    let running = state
                        .children()
                        .get(&child_id)
                        .is_some_and(|child| matches!(child.status, workflow::ChildStatus::Running));
                    if !running {
                        return Ok(None);
                    }
                    let event = match &result {
                        Ok(result) => WorkflowEvent::ChildWorkflowCompleted {
                            child_id,
                            result: result.clone(),
                        },
                        Err(failure) => WorkflowEvent::ChildWorkflowFailed {
                            child_id,
                            failure: failure.clone(),
                        },
                    };
                    Ok(Some(Planned::default().event(event)))
                })
                .await
            }
            CloseAction::CloseChild { child, policy } => {
                let Some(latest) = self.latest_run(&child).await? else {
                    return Ok(None);
                };
                if latest.is_terminal() {
                    return Ok(None);
                }
                let event = match policy {
                    ParentClosePolicy::Abandon => return Ok(None),
                    ParentClosePolicy::RequestCancel => WorkflowEvent::CancelRequested {
                        reason: PARENT_CLOSED.to_string(),
                    },
                    ParentClosePolicy::Terminate => WorkflowEvent::WorkflowCancelled {
                        reason: PARENT_CLOSED.to_string(),
                        terminated: true,
                        compensation: None,
                    },
                };
                info!(child = %latest.execution(), policy = ?policy, "applying parent close policy");
                self.transact(latest.execution(), |_state: &ExecutionState, _now| {
                    Ok(Some(Planned::default().event(event.clone())))
                })
                .await
            }
        }
    }
}

/// Turns a pass's commands into events and the effects they unlock.
fn plan(state: &ExecutionState, commands: Vec<WorkflowCommand>, now: DateTime<Utc>) -> Planned {
    let execution = state.execution();
    let mut planned = Planned::default();
    for command in commands {
        debug!(execution = %execution, command = command.name(), "recording command");
        match command {
            WorkflowCommand::ScheduleActivity(scheduled) => {
                if scheduled.is_compensation() {
                    metrics::counter!("compensations_scheduled_total").increment(1);
                }
                planned
                    .effects
                    .push(Effect::EnqueueActivity(ActivityTask::new(execution, &scheduled, 1, now)));
                planned.events.push(WorkflowEvent::ActivityScheduled(scheduled));
            }
            WorkflowCommand::StartTimer { timer, duration } => {
                planned.effects.push(Effect::ArmTimer {
                    timer: timer.clone(),
                    deadline: deadline_after(now, duration),
                });
                planned.events.push(WorkflowEvent::TimerStarted { timer, duration });
            }
            WorkflowCommand::StartChildWorkflow {
                child_id,
                workflow_type,
                workflow_id,
                input,
                options,
                compensation,
            } => {
                let run_id = RunId::new();
                planned.effects.push(Effect::StartRun(StartRequest {
                    execution: ExecutionKey::new(workflow_id.as_str(), run_id),
                    workflow_type: workflow_type.clone(),
                    input: input.clone(),
                    attempt: 1,
                    retry_policy: options.retry_policy.clone(),
                    execution_timeout: options.execution_timeout,
                    start_delay: None,
                    parent: Some(ParentLink {
                        execution: execution.clone(),
                        child_id,
                    }),
                    previous_run: None,
                }));
                planned.events.push(WorkflowEvent::ChildWorkflowStarted {
                    child_id,
                    workflow_type,
                    workflow_id,
                    run_id,
                    input,
                    options,
                    compensation,
                });
            }
            WorkflowCommand::BeginCompensation { cause } => {
                info!(execution = %execution, cause = %cause, "unwinding compensation stack");
                planned.events.push(WorkflowEvent::CompensationStarted { cause });
            }
            WorkflowCommand::CompleteWorkflow { result } => {
                planned.events.push(WorkflowEvent::WorkflowCompleted { result });
            }
            WorkflowCommand::FailWorkflow { failure } => {
                let next_run = retries_run(state, &failure).then(RunId::new);
                planned
                    .events
                    .push(WorkflowEvent::WorkflowFailed { failure, next_run });
            }
            WorkflowCommand::CancelWorkflow {
                reason,
                compensation,
            } => {
                planned.events.push(WorkflowEvent::WorkflowCancelled {
                    reason,
                    terminated: false,
                    compensation,
                });
            }
            WorkflowCommand::TimeOutWorkflow { failure } => {
                planned.events.push(WorkflowEvent::WorkflowTimedOut { failure });
            }
        }
    }
    planned
}

/// Whether workflow-level retry starts another run after `failure`.
fn retries_run(state: &ExecutionState, failure: &WorkflowFailure) -> bool {
    let policy = state.retry_policy();
    let error = ActivityError::new(failure.kind.clone(), failure.message.clone());
    policy.has_attempts_remaining(state.attempt()) && policy.classify(&error) == ErrorClass::Transient
}

fn close_actions(state: &ExecutionState) -> Vec<CloseAction> {
    let Some(outcome) = state.outcome() else {
        return Vec::new();
    };

    let mut actions = Vec::new();
    match outcome {
        TerminalOutcome::Failed {
            next_run: Some(run_id),
            ..
        } => {
            let execution = state.execution();
            actions.push(CloseAction::StartNextRun(StartRequest {
                execution: ExecutionKey::new(execution.workflow_id.clone(), *run_id),
                workflow_type: state.workflow_type().to_string(),
                input: state.input().clone(),
                attempt: state.attempt() + 1,
                retry_policy: state.retry_policy().clone(),
                execution_timeout: state.execution_timeout(),
                start_delay: Some(state.retry_policy().delay_after_attempt(state.attempt())),
                parent: state.parent().cloned(),
                previous_run: Some(execution.run_id),
            }));
        }
        _ => {
            if let Some(parent) = state.parent() {
                actions.push(CloseAction::ReportToParent {
                    parent: parent.clone(),
                    result: outcome_result(outcome),
                });
            }
        }
    }

    for (_, child) in state.open_children() {
        if child.options.parent_close_policy != ParentClosePolicy::Abandon {
            actions.push(CloseAction::CloseChild {
                child: child.execution(),
                policy: child.options.parent_close_policy,
            });
        }
    }
    actions
}

/// The result a run's caller (client or parent) sees.
pub fn outcome_result(outcome: &TerminalOutcome) -> std::result::Result<Value, WorkflowFailure> {
    match outcome {
        TerminalOutcome::Completed { result } => Ok(result.clone()),
        TerminalOutcome::Failed { failure, .. } | TerminalOutcome::TimedOut { failure } => {
            Err(failure.clone())
        }
        TerminalOutcome::Cancelled {
            reason,
            terminated,
            compensation,
        } => {
            let kind = if *terminated {
                CHILD_TERMINATED
            } else {
                CHILD_CANCELLED
            };
            Err(WorkflowFailure::new(kind, reason.clone()).with_compensation(compensation.clone()))
        }
    }
}
