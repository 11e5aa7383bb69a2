//! Options attached to activities and child workflows at schedule time.

use std::time::Duration;

use common::RetryPolicy;
use saga::{CompensationInput, CompensationRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Queue activities are dispatched on unless the author picks another.
pub const DEFAULT_TASK_QUEUE: &str = "default";

/// How an activity is dispatched, timed out and retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    pub task_queue: String,
    pub retry_policy: RetryPolicy,
    /// Bound on a single attempt once a worker picked it up.
    pub start_to_close_timeout: Duration,
    /// Bound on the whole activity, including every retry and backoff.
    #[serde(default)]
    pub schedule_to_close_timeout: Option<Duration>,
    /// Maximum silence between heartbeats of a running attempt.
    #[serde(default)]
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            retry_policy: RetryPolicy::default()
                .with_maximum_interval(Duration::from_secs(30))
                .with_maximum_attempts(5),
            start_to_close_timeout: Duration::from_secs(30),
            schedule_to_close_timeout: None,
            heartbeat_timeout: None,
        }
    }
}

impl ActivityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = task_queue.into();
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }

    pub fn schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }

    /// Options a compensation activity runs with.
    pub fn for_compensation(compensation: &CompensationRef) -> Self {
        Self {
            task_queue: compensation.task_queue.clone(),
            retry_policy: compensation.retry_policy.clone(),
            ..Self::default()
        }
    }
}

/// What happens to an open child when its parent reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ParentClosePolicy {
    /// The child keeps running.
    Abandon,
    /// The child receives a cancellation request.
    RequestCancel,
    /// The child is closed immediately.
    #[default]
    Terminate,
}

/// Options for starting a child workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildWorkflowOptions {
    /// Workflow-level retry policy of the child; restarts the whole child run.
    pub retry_policy: RetryPolicy,
    pub parent_close_policy: ParentClosePolicy,
    #[serde(default)]
    pub execution_timeout: Option<Duration>,
}

impl Default for ChildWorkflowOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::no_retry(),
            parent_close_policy: ParentClosePolicy::default(),
            execution_timeout: None,
        }
    }
}

impl ChildWorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn parent_close_policy(mut self, policy: ParentClosePolicy) -> Self {
        self.parent_close_policy = policy;
        self
    }

    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

/// The undo action a workflow author attaches to a compensable step.
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationSpec {
    pub activity: String,
    pub input: CompensationInput,
    pub retry_policy: RetryPolicy,
    /// Defaults to the forward step's queue.
    pub task_queue: Option<String>,
}

impl CompensationSpec {
    /// Compensates with `activity`, fed the forward step's input.
    pub fn new(activity: impl Into<String>) -> Self {
        Self {
            activity: activity.into(),
            input: CompensationInput::ForwardInput,
            retry_policy: RetryPolicy::compensation(),
            task_queue: None,
        }
    }

    /// Feeds the compensation the forward step's result.
    pub fn with_result(mut self) -> Self {
        self.input = CompensationInput::ForwardResult;
        self
    }

    /// Feeds the compensation a fixed value.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = CompensationInput::Explicit(input);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    /// Binds this compensation to a forward step.
    pub(crate) fn bind(self, step: &str, forward_input: &Value, forward_queue: &str) -> CompensationRef {
        CompensationRef::new(step, forward_input.clone(), self.activity)
            .with_input(self.input)
            .with_retry_policy(self.retry_policy)
            .with_task_queue(self.task_queue.unwrap_or_else(|| forward_queue.to_string()))
    }
}
