//! Activity tasks handed to workers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ActivityTaskId, ExecutionKey, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use workflow::{ActivityRecord, ScheduledActivity};

/// One attempt of one activity, as seen by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub task_id: ActivityTaskId,
    pub activity_type: String,
    pub input: Value,
    pub task_queue: String,
    pub retry_policy: RetryPolicy,
    pub start_to_close_timeout: Duration,
    pub heartbeat_timeout: Option<Duration>,
    /// Past this instant no further attempt is made.
    pub schedule_deadline: Option<DateTime<Utc>>,
}

impl ActivityTask {
    pub(crate) fn new(
        execution: &ExecutionKey,
        scheduled: &ScheduledActivity,
        attempt: u32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        let options = &scheduled.options;
        Self {
            task_id: ActivityTaskId::new(execution.clone(), scheduled.activity_id, attempt),
            activity_type: scheduled.activity_type.clone(),
            input: scheduled.input.clone(),
            task_queue: options.task_queue.clone(),
            retry_policy: options.retry_policy.clone(),
            start_to_close_timeout: options.start_to_close_timeout,
            heartbeat_timeout: options.heartbeat_timeout,
            schedule_deadline: options
                .schedule_to_close_timeout
                .map(|timeout| deadline_after(scheduled_at, timeout)),
        }
    }

    pub(crate) fn from_record(execution: &ExecutionKey, record: &ActivityRecord, attempt: u32) -> Self {
        Self::new(execution, &record.scheduled, attempt, record.scheduled_at)
    }

    pub fn execution(&self) -> &ExecutionKey {
        &self.task_id.execution
    }

    pub fn attempt(&self) -> u32 {
        self.task_id.attempt
    }
}

/// `at + duration`, saturating at the latest representable instant.
pub(crate) fn deadline_after(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|duration| at.checked_add_signed(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
