//! In-process workers: workflow passes and activity attempts.

use std::sync::Arc;

use chrono::Utc;
use common::{ActivityError, ExecutionKey};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};
use workflow::WorkflowError;

use crate::activity::ActivityContext;
use crate::error::RuntimeError;
use crate::runtime::Engine;
use crate::task::{ActivityTask, deadline_after};
use crate::timer::FiredTimer;

impl Engine {
    /// Runs workflow passes for queued executions until shutdown.
    pub(crate) async fn run_workflow_worker(self: Arc<Self>, worker: usize) {
        let mut shutdown = self.shutdown.clone();
        debug!(worker, "workflow worker started");
        while let Some(execution) = self.workflow_queue.pop(&mut shutdown).await {
            let pass = self.drive(&execution).await;
            match pass {
                Ok(()) => {}
                Err(RuntimeError::NotFound(_)) => {
                    debug!(execution = %execution, "execution vanished before its pass");
                }
                Err(RuntimeError::Workflow(err @ WorkflowError::Nondeterminism { .. })) => {
                    // The run stays blocked until its code matches its history again
                    error!(execution = %execution, error = %err, "workflow code diverged from history");
                }
                Err(err) => {
                    warn!(execution = %execution, error = %err, "workflow pass failed, requeueing");
                    self.clone().requeue_later(execution);
                }
            }
        }
        debug!(worker, "workflow worker stopped");
    }

    /// Queues another pass after one sweep interval, unless shutting down.
    fn requeue_later(self: Arc<Self>, execution: ExecutionKey) {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.options.dispatcher_sweep_interval) => {
                    self.workflow_queue.push(execution).await;
                }
                _ = shutdown.changed() => {}
            }
        });
    }

    /// Spawns one poller per configured activity queue. All pollers share a
    /// single concurrency limit; tasks wait in their queue while it is
    /// exhausted.
    pub(crate) fn spawn_activity_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_activities));
        self.options
            .activity_queues
            .iter()
            .map(|queue| tokio::spawn(self.clone().run_activity_worker(queue.clone(), permits.clone())))
            .collect()
    }

    async fn run_activity_worker(self: Arc<Self>, queue: String, permits: Arc<Semaphore>) {
        let mut shutdown = self.shutdown.clone();
        let mut running = JoinSet::new();
        debug!(queue = %queue, "activity worker started");

        loop {
            let permit = tokio::select! {
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            let Some(task) = self.next_activity_task(&queue, &mut shutdown).await else {
                break;
            };

            let engine = self.clone();
            running.spawn(async move {
                let _permit = permit;
                engine.run_attempt(task).await;
            });
            while running.try_join_next().is_some() {}
        }

        // Attempts cut short here are retried after recovery
        running.abort_all();
        debug!(queue = %queue, "activity worker stopped");
    }

    async fn run_attempt(self: Arc<Self>, task: ActivityTask) {
        let result = match self.activities.get(&task.activity_type) {
            None => Err(ActivityError::unregistered(&task.activity_type)),
            Some(activity) => {
                let ctx = ActivityContext::new(self.clone(), &task);
                match tokio::time::timeout(
                    task.start_to_close_timeout,
                    activity.execute(ctx, task.input.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ActivityError::timeout(format!(
                        "start-to-close timeout of {:?} exceeded",
                        task.start_to_close_timeout
                    ))),
                }
            }
        };

        if let Err(err) = self.resolve_activity_task(&task.task_id, result).await {
            warn!(task = %task.task_id, error = %err, "failed to record activity outcome");
        }
    }

    /// Records fired timers until the timer service stops.
    pub(crate) async fn run_timer_pump(self: Arc<Self>, mut fired: mpsc::UnboundedReceiver<FiredTimer>) {
        while let Some(FiredTimer { execution, timer }) = fired.recv().await {
            let engine = self.clone();
            tokio::spawn(async move {
                let recorded = engine.fire_timer(&execution, &timer).await;
                match recorded {
                    Ok(_) | Err(RuntimeError::NotFound(_)) => {}
                    Err(err) => {
                        warn!(execution = %execution, timer = %timer, error = %err, "failed to record fired timer, re-arming");
                        let retry_at = deadline_after(Utc::now(), engine.options.dispatcher_sweep_interval);
                        engine.timers.arm(execution, timer, retry_at);
                    }
                }
            });
        }
    }
}
