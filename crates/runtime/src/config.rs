//! Runtime tuning.

use std::time::Duration;

use workflow::DEFAULT_TASK_QUEUE;

/// Options for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Number of tasks driving workflow passes concurrently.
    pub workflow_workers: usize,
    /// Upper bound on activity attempts running at once in this process.
    pub max_concurrent_activities: usize,
    /// Queues the in-process activity workers poll. Leave empty to run
    /// activities on external workers only.
    pub activity_queues: Vec<String>,
    /// How often the dispatcher looks for attempts past their start-to-close
    /// or heartbeat deadline.
    pub dispatcher_sweep_interval: Duration,
    /// How long closed executions are kept before their history is purged.
    /// `None` keeps them forever.
    pub retention: Option<Duration>,
    pub retention_sweep_interval: Duration,
    /// How many times a pass is retried after losing an append race.
    pub max_append_retries: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workflow_workers: 4,
            max_concurrent_activities: 10,
            activity_queues: vec![DEFAULT_TASK_QUEUE.to_string()],
            dispatcher_sweep_interval: Duration::from_millis(250),
            retention: None,
            retention_sweep_interval: Duration::from_secs(60),
            max_append_retries: 5,
        }
    }
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn workflow_workers(mut self, workers: usize) -> Self {
        self.workflow_workers = workers.max(1);
        self
    }

    pub fn max_concurrent_activities(mut self, limit: usize) -> Self {
        self.max_concurrent_activities = limit.max(1);
        self
    }

    /// Replaces the queues polled by in-process workers.
    pub fn activity_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.activity_queues = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn dispatcher_sweep_interval(mut self, interval: Duration) -> Self {
        self.dispatcher_sweep_interval = interval;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn retention_sweep_interval(mut self, interval: Duration) -> Self {
        self.retention_sweep_interval = interval;
        self
    }

    pub fn max_append_retries(mut self, retries: u32) -> Self {
        self.max_append_retries = retries;
        self
    }
}
