//! Activity dispatch: the worker protocol, retry decisions and timeouts.
//!
//! Workers poll tasks, then complete or fail them by [`ActivityTaskId`].
//! Every outcome goes through one classification step. A transient failure
//! with attempts left records `ActivityAttemptFailed` plus a backoff timer;
//! anything else resolves the activity for good. Because the attempt number
//! is part of the task id, an outcome reported for an attempt that is no
//! longer current is ignored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ActivityError, ActivityTaskId, ErrorClass, RetryPolicy};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use workflow::{ActivityStatus, ExecutionState, TimerRef, WorkflowEvent};

use crate::driver::{Effect, Planned};
use crate::error::{Result, RuntimeError};
use crate::runtime::Engine;
use crate::task::{ActivityTask, deadline_after};

/// An attempt's result after classification against its retry policy.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Success(Value),
    TransientFailure(ActivityError),
    PermanentFailure(ActivityError),
}

impl DispatchOutcome {
    pub fn classify(policy: &RetryPolicy, result: std::result::Result<Value, ActivityError>) -> Self {
        match result {
            Ok(value) => DispatchOutcome::Success(value),
            Err(error) => match policy.classify(&error) {
                ErrorClass::Transient => DispatchOutcome::TransientFailure(error),
                ErrorClass::Permanent => DispatchOutcome::PermanentFailure(error),
            },
        }
    }
}

/// What gets recorded for an attempt's outcome.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    Completed {
        result: Value,
    },
    Retry {
        error: ActivityError,
        delay: Duration,
        next_attempt: u32,
    },
    Failed {
        error: ActivityError,
        attempts: u32,
    },
}

impl Resolution {
    pub fn decide(task: &ActivityTask, outcome: DispatchOutcome, now: DateTime<Utc>) -> Self {
        let attempt = task.attempt();
        let error = match outcome {
            DispatchOutcome::Success(result) => return Resolution::Completed { result },
            DispatchOutcome::PermanentFailure(error) => {
                return Resolution::Failed {
                    error,
                    attempts: attempt,
                };
            }
            DispatchOutcome::TransientFailure(error) => error,
        };

        if !task.retry_policy.has_attempts_remaining(attempt) {
            return Resolution::Failed {
                error,
                attempts: attempt,
            };
        }

        let delay = task.retry_policy.delay_after_attempt(attempt);
        if let Some(deadline) = task.schedule_deadline
            && deadline_after(now, delay) >= deadline
        {
            return Resolution::Failed {
                error: ActivityError::timeout(format!(
                    "schedule-to-close timeout reached after attempt {attempt}: {}",
                    error.message
                )),
                attempts: attempt,
            };
        }

        Resolution::Retry {
            error,
            delay,
            next_attempt: attempt + 1,
        }
    }

    fn into_planned(self, task: &ActivityTask, now: DateTime<Utc>) -> Planned {
        let activity_id = task.task_id.activity_id;
        let attempt = task.attempt();
        match self {
            Resolution::Completed { result } => Planned::default().event(WorkflowEvent::ActivityCompleted {
                activity_id,
                result,
                attempt,
            }),
            Resolution::Retry {
                error,
                delay,
                next_attempt,
            } => {
                let timer = TimerRef::ActivityRetry {
                    activity_id,
                    attempt: next_attempt,
                };
                Planned::default()
                    .event(WorkflowEvent::ActivityAttemptFailed {
                        activity_id,
                        attempt,
                        error,
                        retry_delay: delay,
                    })
                    .event(WorkflowEvent::TimerStarted {
                        timer: timer.clone(),
                        duration: delay,
                    })
                    .effect(Effect::ArmTimer {
                        timer,
                        deadline: deadline_after(now, delay),
                    })
            }
            Resolution::Failed { error, attempts } => Planned::default().event(WorkflowEvent::ActivityFailed {
                activity_id,
                error,
                attempts,
            }),
        }
    }
}

/// An attempt handed to a worker and not resolved yet.
#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub task: ActivityTask,
    pub started: Instant,
    pub last_heartbeat: Instant,
}

impl InFlight {
    /// The error the attempt is failed with if it overran a deadline at `now`.
    fn expired(&self, now: Instant, wall_clock: DateTime<Utc>) -> Option<ActivityError> {
        if let Some(deadline) = self.task.schedule_deadline
            && wall_clock >= deadline
        {
            return Some(ActivityError::timeout("schedule-to-close timeout reached"));
        }
        if now.duration_since(self.started) > self.task.start_to_close_timeout {
            return Some(ActivityError::timeout(format!(
                "start-to-close timeout of {:?} exceeded",
                self.task.start_to_close_timeout
            )));
        }
        if let Some(timeout) = self.task.heartbeat_timeout
            && now.duration_since(self.last_heartbeat) > timeout
        {
            return Some(ActivityError::heartbeat_timeout(format!(
                "no heartbeat for {timeout:?}"
            )));
        }
        None
    }
}

impl Engine {
    /// Hands out the next task on `queue` without waiting.
    pub(crate) async fn poll_activity_task(&self, queue: &str) -> Option<ActivityTask> {
        let task = self.activity_queues.try_pop(queue).await?;
        self.mark_started(&task).await;
        Some(task)
    }

    /// Waits for the next task on `queue`; `None` once shutdown is signalled.
    pub(crate) async fn next_activity_task(
        &self,
        queue: &str,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Option<ActivityTask> {
        let task = self.activity_queues.pop(queue, shutdown).await?;
        self.mark_started(&task).await;
        Some(task)
    }

    async fn mark_started(&self, task: &ActivityTask) {
        let now = Instant::now();
        self.in_flight.lock().await.insert(
            task.task_id.clone(),
            InFlight {
                task: task.clone(),
                started: now,
                last_heartbeat: now,
            },
        );
        metrics::counter!("activity_attempts_total").increment(1);
        debug!(task = %task.task_id, activity = %task.activity_type, "activity attempt started");
    }

    pub(crate) async fn heartbeat_activity_task(&self, task_id: &ActivityTaskId) -> bool {
        match self.in_flight.lock().await.get_mut(task_id) {
            Some(in_flight) => {
                in_flight.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Resolves an attempt with the worker's result.
    ///
    /// Returns false when the attempt is not current any more (it timed out,
    /// was already resolved, or its run closed) and the result was dropped.
    /// An outcome that could not be recorded leaves the attempt in flight.
    #[instrument(skip(self, result), fields(task = %task_id))]
    pub(crate) async fn resolve_activity_task(
        &self,
        task_id: &ActivityTaskId,
        result: std::result::Result<Value, ActivityError>,
    ) -> Result<bool> {
        let Some(in_flight) = self.in_flight.lock().await.remove(task_id) else {
            debug!("dropping outcome of an attempt that is no longer in flight");
            return Ok(false);
        };
        let outcome = DispatchOutcome::classify(&in_flight.task.retry_policy, result);
        let recorded = self.record_outcome(&in_flight.task, outcome).await;
        match recorded {
            Err(err) if !matches!(err, RuntimeError::NotFound(_)) => {
                // Still owed: a worker may report again, or the reaper times it out
                self.restore_in_flight(in_flight).await;
                Err(err)
            }
            recorded => recorded,
        }
    }

    /// Puts back an attempt whose outcome could not be recorded.
    async fn restore_in_flight(&self, in_flight: InFlight) {
        self.in_flight
            .lock()
            .await
            .entry(in_flight.task.task_id.clone())
            .or_insert(in_flight);
    }

    pub(crate) async fn record_outcome(
        &self,
        task: &ActivityTask,
        outcome: DispatchOutcome,
    ) -> Result<bool> {
        let execution = task.execution().clone();
        let recorded = self
            .record(&execution, |state: &ExecutionState, now| {
                if !is_current_attempt(state, task) {
                    return Ok(None);
                }
                let resolution = Resolution::decide(task, outcome.clone(), now);
                match &resolution {
                    Resolution::Completed { .. } => {}
                    Resolution::Retry { error, delay, .. } => {
                        metrics::counter!("activity_retries_total").increment(1);
                        info!(task = %task.task_id, error = %error, delay = ?delay, "activity attempt failed, retrying");
                    }
                    Resolution::Failed { error, attempts } => {
                        warn!(task = %task.task_id, error = %error, attempts, "activity failed");
                    }
                }
                Ok(Some(resolution.into_planned(task, now)))
            })
            .await?;
        Ok(recorded)
    }

    /// Removes and returns attempts that overran a deadline.
    pub(crate) async fn expired_attempts(&self) -> Vec<(InFlight, ActivityError)> {
        let now = Instant::now();
        let wall_clock = Utc::now();
        let mut in_flight = self.in_flight.lock().await;
        let expired: Vec<(ActivityTaskId, ActivityError)> = in_flight
            .iter()
            .filter_map(|(id, attempt)| attempt.expired(now, wall_clock).map(|err| (id.clone(), err)))
            .collect();

        expired
            .into_iter()
            .filter_map(|(id, error)| in_flight.remove(&id).map(|attempt| (attempt, error)))
            .collect()
    }

    /// Fails attempts past their start-to-close, heartbeat or
    /// schedule-to-close deadline, until shutdown.
    pub(crate) async fn run_reaper(self: std::sync::Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.options.dispatcher_sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }

            for (attempt, error) in self.expired_attempts().await {
                let task = &attempt.task;
                warn!(task = %task.task_id, error = %error, "activity attempt timed out");
                let outcome = DispatchOutcome::classify(&task.retry_policy, Err(error));
                let recorded = self.record_outcome(task, outcome).await;
                match recorded {
                    Ok(_) | Err(RuntimeError::NotFound(_)) => {}
                    Err(err) => {
                        warn!(task = %task.task_id, error = %err, "failed to record activity timeout, retrying next sweep");
                        self.restore_in_flight(attempt).await;
                    }
                }
            }
        }
    }
}

fn is_current_attempt(state: &ExecutionState, task: &ActivityTask) -> bool {
    state.activity(task.task_id.activity_id).is_some_and(|record| {
        matches!(record.status, ActivityStatus::Scheduled { attempt } if attempt == task.attempt())
    })
}
