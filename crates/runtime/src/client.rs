//! Client APIs: workflow lifecycle and the activity worker protocol.

use std::sync::Arc;
use std::time::Duration;

use common::{ActivityError, ActivityTaskId, ExecutionKey, RetryPolicy, RunId, WorkflowId};
use event_store::EventQuery;
use serde_json::Value;
use tracing::{info, instrument};
use workflow::{ExecutionState, ExecutionStatus, HistoryEvent, WorkflowEvent, WorkflowFailure};

use crate::driver::{Planned, StartRequest, outcome_result};
use crate::error::{Result, RuntimeError};
use crate::runtime::Engine;
use crate::task::ActivityTask;

const STARTED_EVENT: &str = "WorkflowStarted";

/// Options for starting a workflow.
#[derive(Debug, Clone, PartialEq)]
pub struct StartWorkflowOptions {
    pub workflow_id: String,
    /// Workflow-level retry: a failed run is followed by a fresh run of the
    /// same execution. Defaults to a single run.
    pub retry_policy: RetryPolicy,
    pub execution_timeout: Option<Duration>,
}

impl StartWorkflowOptions {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            retry_policy: RetryPolicy::no_retry(),
            execution_timeout: None,
        }
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// The final result of an execution, after any workflow-level retries.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowOutcome {
    /// The run that produced the result.
    pub execution: ExecutionKey,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub result: std::result::Result<Value, WorkflowFailure>,
}

impl WorkflowOutcome {
    fn from_state(state: &ExecutionState) -> Option<Self> {
        let outcome = state.outcome()?;
        Some(Self {
            execution: state.execution().clone(),
            status: state.status(),
            attempt: state.attempt(),
            result: outcome_result(outcome),
        })
    }

    pub fn into_result(self) -> std::result::Result<Value, WorkflowFailure> {
        self.result
    }
}

/// Starts, signals, queries, cancels and awaits workflows.
#[derive(Debug, Clone)]
pub struct WorkflowClient {
    engine: Arc<Engine>,
}

impl WorkflowClient {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Records `WorkflowStarted` for a new run and returns its key.
    ///
    /// Fails with [`RuntimeError::AlreadyRunning`] while another run of the
    /// same workflow id is open.
    #[instrument(skip(self, input), fields(workflow_id = %options.workflow_id))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        options: StartWorkflowOptions,
    ) -> Result<ExecutionKey> {
        if *self.engine.shutdown.borrow() {
            return Err(RuntimeError::ShuttingDown);
        }
        self.engine.workflows.get(workflow_type)?;
        options.retry_policy.validate()?;

        let _guard = self.engine.start_lock.lock().await;
        if let Some(open) = self.open_run(&options.workflow_id).await? {
            return Err(RuntimeError::AlreadyRunning {
                workflow_id: options.workflow_id,
                run_id: open.run_id,
            });
        }

        let execution = ExecutionKey::new(options.workflow_id.as_str(), RunId::new());
        self.engine
            .start_run(StartRequest {
                execution: execution.clone(),
                workflow_type: workflow_type.to_string(),
                input,
                attempt: 1,
                retry_policy: options.retry_policy,
                execution_timeout: options.execution_timeout,
                start_delay: None,
                parent: None,
                previous_run: None,
            })
            .await?;
        Ok(execution)
    }

    /// The open run of `workflow_id`, if any.
    pub async fn open_run(&self, workflow_id: &str) -> Result<Option<ExecutionKey>> {
        let query = EventQuery::for_workflow(WorkflowId::new(workflow_id))
            .event_type(STARTED_EVENT);
        for started in self.engine.store.query_events(query).await? {
            let Some(state) = self.engine.load_state(&started.execution).await? else {
                continue;
            };
            if !state.is_terminal() {
                return Ok(Some(started.execution));
            }
        }
        Ok(None)
    }

    /// Delivers a signal. Signals are recorded in arrival order.
    #[instrument(skip(self, payload), fields(execution = %execution))]
    pub async fn signal(&self, execution: &ExecutionKey, name: &str, payload: Value) -> Result<()> {
        let recorded = self
            .engine
            .record(execution, |_state: &ExecutionState, _now| {
                Ok(Some(Planned::default().event(WorkflowEvent::SignalReceived {
                    name: name.to_string(),
                    payload: payload.clone(),
                })))
            })
            .await?;
        if !recorded {
            return Err(RuntimeError::ExecutionClosed(execution.clone()));
        }
        Ok(())
    }

    /// Requests cancellation. What happens next depends on the workflow's
    /// cancellation policy; by default the compensation stack unwinds.
    #[instrument(skip(self), fields(execution = %execution))]
    pub async fn cancel(&self, execution: &ExecutionKey, reason: &str) -> Result<()> {
        let recorded = self
            .engine
            .record(execution, |_state: &ExecutionState, _now| {
                Ok(Some(Planned::default().event(WorkflowEvent::CancelRequested {
                    reason: reason.to_string(),
                })))
            })
            .await?;
        if !recorded {
            return Err(RuntimeError::ExecutionClosed(execution.clone()));
        }
        info!(reason, "cancellation requested");
        Ok(())
    }

    /// Closes a run immediately, without compensation.
    #[instrument(skip(self), fields(execution = %execution))]
    pub async fn terminate(&self, execution: &ExecutionKey, reason: &str) -> Result<()> {
        let committed = self
            .engine
            .transact(execution, |_state: &ExecutionState, _now| {
                Ok(Some(Planned::default().event(WorkflowEvent::WorkflowCancelled {
                    reason: reason.to_string(),
                    terminated: true,
                    compensation: None,
                })))
            })
            .await?;
        let Some(committed) = committed else {
            return Err(RuntimeError::ExecutionClosed(execution.clone()));
        };
        self.engine.realize(committed).await;
        Ok(())
    }

    /// Answers a query without recording anything.
    pub async fn query(&self, execution: &ExecutionKey, name: &str) -> Result<Value> {
        let state = self.state(execution).await?;
        let definition = self.engine.workflows.get(state.workflow_type())?;
        workflow::query(definition.as_ref(), &state, name)?.ok_or_else(|| RuntimeError::UnknownQuery {
            execution: execution.clone(),
            name: name.to_string(),
        })
    }

    pub async fn status(&self, execution: &ExecutionKey) -> Result<ExecutionStatus> {
        Ok(self.state(execution).await?.status())
    }

    pub async fn history(&self, execution: &ExecutionKey) -> Result<Vec<HistoryEvent>> {
        let history = self.engine.load_history(execution).await?;
        if history.is_empty() {
            return Err(RuntimeError::NotFound(execution.clone()));
        }
        Ok(history)
    }

    /// Waits for the execution to finish, following workflow-level retries
    /// to the final run.
    pub async fn get_result(&self, execution: &ExecutionKey, timeout: Duration) -> Result<WorkflowOutcome> {
        let mut closed = self.engine.closed.subscribe();
        let wait = async {
            loop {
                closed.mark_unchanged();
                let state = self
                    .engine
                    .latest_run(execution)
                    .await?
                    .ok_or_else(|| RuntimeError::NotFound(execution.clone()))?;
                if !has_next_run(&state)
                    && let Some(outcome) = WorkflowOutcome::from_state(&state)
                {
                    return Ok(outcome);
                }
                if closed.changed().await.is_err() {
                    return Err(RuntimeError::ShuttingDown);
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RuntimeError::Timeout(execution.clone()))?
    }

    async fn state(&self, execution: &ExecutionKey) -> Result<ExecutionState> {
        self.engine
            .load_state(execution)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(execution.clone()))
    }
}

fn has_next_run(state: &ExecutionState) -> bool {
    matches!(
        state.outcome(),
        Some(workflow::TerminalOutcome::Failed {
            next_run: Some(_),
            ..
        })
    )
}

/// The worker protocol, for activity workers that run outside the runtime.
///
/// A worker polls a queue, runs the task and reports the outcome under the
/// task id it received. Outcomes for attempts that are no longer current
/// are acknowledged with `false` and dropped.
#[derive(Debug, Clone)]
pub struct ActivityTaskClient {
    engine: Arc<Engine>,
}

impl ActivityTaskClient {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub async fn poll(&self, queue: &str) -> Option<ActivityTask> {
        self.engine.poll_activity_task(queue).await
    }

    pub async fn complete(&self, task_id: &ActivityTaskId, result: Value) -> Result<bool> {
        self.engine.resolve_activity_task(task_id, Ok(result)).await
    }

    /// Fails the attempt; `permanent` skips any remaining retries.
    pub async fn fail(&self, task_id: &ActivityTaskId, mut error: ActivityError, permanent: bool) -> Result<bool> {
        error.non_retryable |= permanent;
        self.engine.resolve_activity_task(task_id, Err(error)).await
    }

    pub async fn heartbeat(&self, task_id: &ActivityTaskId) -> bool {
        self.engine.heartbeat_activity_task(task_id).await
    }
}
