//! Startup recovery and history retention.
//!
//! Nothing but history survives a restart. Recovery folds every execution
//! and rebuilds the in-process work it implies: open activity attempts are
//! queued again (activities run at least once), unfired timers are re-armed
//! from their recorded deadlines, and children whose start was interrupted
//! are started. Closed runs repeat their close actions, which are
//! idempotent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::ExecutionKey;
use tracing::{debug, info, instrument, warn};
use workflow::{ActivityStatus, ExecutionState, ParentLink};

use crate::driver::StartRequest;
use crate::error::Result;
use crate::runtime::Engine;
use crate::task::ActivityTask;

/// What a recovery pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Open runs whose work was re-queued.
    pub resumed: usize,
    /// Closed runs whose close actions were repeated.
    pub closed: usize,
    /// Executions whose history could not be folded.
    pub unreadable: usize,
}

impl Engine {
    #[instrument(skip(self))]
    pub(crate) async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for execution in self.store.list_executions().await? {
            let state = match self.load_state(&execution).await {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(err) => {
                    warn!(execution = %execution, error = %err, "skipping unreadable execution");
                    report.unreadable += 1;
                    continue;
                }
            };

            if state.is_terminal() {
                for committed in self.run_close_actions(&state).await {
                    self.realize(committed).await;
                }
                report.closed += 1;
            } else {
                self.resume(&state).await;
                report.resumed += 1;
            }
        }

        info!(
            resumed = report.resumed,
            closed = report.closed,
            unreadable = report.unreadable,
            "recovery complete"
        );
        Ok(report)
    }

    async fn resume(&self, state: &ExecutionState) {
        let execution = state.execution();
        for (_, record) in state.open_activities() {
            // Retrying activities are re-queued when their backoff timer fires
            if let ActivityStatus::Scheduled { attempt } = record.status {
                self.activity_queues
                    .push(ActivityTask::from_record(execution, record, attempt))
                    .await;
            }
        }

        for (timer, record) in state.pending_timers() {
            self.timers
                .arm(execution.clone(), timer.clone(), record.deadline());
        }

        for (child_id, child) in state.open_children() {
            let request = StartRequest {
                execution: child.execution(),
                workflow_type: child.workflow_type.clone(),
                input: child.input.clone(),
                attempt: 1,
                retry_policy: child.options.retry_policy.clone(),
                execution_timeout: child.options.execution_timeout,
                start_delay: None,
                parent: Some(ParentLink {
                    execution: execution.clone(),
                    child_id: *child_id,
                }),
                previous_run: None,
            };
            if let Err(err) = self.start_run(request).await {
                warn!(execution = %execution, child_id, error = %err, "failed to start child");
            }
        }

        self.workflow_queue.push(execution.clone()).await;
        debug!(execution = %execution, "execution resumed");
    }

    /// Purges closed executions that closed longer than `retention` ago.
    pub(crate) async fn purge_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let mut purged = 0;
        for execution in self.store.list_executions().await? {
            if self.closed_before(&execution, cutoff).await? {
                let events = self.store.purge_execution(&execution).await?;
                debug!(execution = %execution, events, "purged closed execution");
                purged += 1;
            }
        }
        if purged > 0 {
            metrics::counter!("executions_purged_total").increment(purged as u64);
            info!(purged, "retention sweep purged closed executions");
        }
        Ok(purged)
    }

    async fn closed_before(
        &self,
        execution: &ExecutionKey,
        cutoff: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        match self.load_state(execution).await {
            Ok(Some(state)) => Ok(state.closed_at().is_some_and(|closed| closed < cutoff)),
            Ok(None) => Ok(false),
            Err(err) => {
                warn!(execution = %execution, error = %err, "skipping unreadable execution");
                Ok(false)
            }
        }
    }

    pub(crate) async fn run_retention(self: Arc<Self>, retention: Duration) {
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.options.retention_sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => return,
            }
            if let Err(err) = self.purge_expired(retention).await {
                warn!(error = %err, "retention sweep failed");
            }
        }
    }
}
