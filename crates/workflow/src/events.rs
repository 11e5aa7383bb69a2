//! Workflow history events.
//!
//! These are the facts the engine records for one execution. The
//! interpreter never stores derived state: everything it knows about an
//! execution is obtained by folding these events in sequence order.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ActivityError, ExecutionKey, RetryPolicy, RunId};
use event_store::{EventEnvelope, SequenceNo};
use saga::{CompensationRef, CompensationReport};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::failure::WorkflowFailure;
use crate::options::{ActivityOptions, ChildWorkflowOptions};

/// Identifies what a timer is for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum TimerRef {
    /// A durable sleep requested by workflow code.
    Workflow { timer_id: u64 },
    /// Backoff before the given attempt of an activity.
    ActivityRetry { activity_id: u64, attempt: u32 },
    /// The execution timeout of the run.
    ExecutionTimeout,
    /// Workflow-level retry backoff before the run's code starts.
    StartDelay,
}

impl std::fmt::Display for TimerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimerRef::Workflow { timer_id } => write!(f, "timer-{timer_id}"),
            TimerRef::ActivityRetry {
                activity_id,
                attempt,
            } => write!(f, "retry-{activity_id}#{attempt}"),
            TimerRef::ExecutionTimeout => f.write_str("execution-timeout"),
            TimerRef::StartDelay => f.write_str("start-delay"),
        }
    }
}

/// The parent a child execution reports to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub execution: ExecutionKey,
    /// Command id of the child in the parent's history.
    pub child_id: u64,
}

/// An activity scheduled by workflow code or by the compensation unwind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledActivity {
    pub activity_id: u64,
    pub activity_type: String,
    pub input: Value,
    pub options: ActivityOptions,
    /// Set when the step is compensable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationRef>,
    /// Set when this activity compensates the stack entry at that index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensates: Option<usize>,
}

impl ScheduledActivity {
    pub fn is_compensation(&self) -> bool {
        self.compensates.is_some()
    }
}

/// Why the compensation stack started unwinding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "data")]
pub enum UnwindCause {
    Failed(WorkflowFailure),
    Cancelled { reason: String },
    TimedOut,
}

impl std::fmt::Display for UnwindCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnwindCause::Failed(failure) => write!(f, "failed: {failure}"),
            UnwindCause::Cancelled { reason } => write!(f, "cancelled: {reason}"),
            UnwindCause::TimedOut => f.write_str("execution timed out"),
        }
    }
}

/// Events recorded in a workflow execution's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum WorkflowEvent {
    WorkflowStarted {
        workflow_type: String,
        input: Value,
        /// 1 for the first run, incremented by workflow-level retry.
        attempt: u32,
        retry_policy: RetryPolicy,
        #[serde(default)]
        execution_timeout: Option<Duration>,
        #[serde(default)]
        start_delay: Option<Duration>,
        #[serde(default)]
        parent: Option<ParentLink>,
        #[serde(default)]
        previous_run: Option<RunId>,
    },

    ActivityScheduled(ScheduledActivity),

    /// An attempt failed transiently and will be retried after `retry_delay`.
    ActivityAttemptFailed {
        activity_id: u64,
        attempt: u32,
        error: ActivityError,
        retry_delay: Duration,
    },

    ActivityCompleted {
        activity_id: u64,
        result: Value,
        attempt: u32,
    },

    /// The activity failed for good: permanent error or retries exhausted.
    ActivityFailed {
        activity_id: u64,
        error: ActivityError,
        attempts: u32,
    },

    TimerStarted {
        timer: TimerRef,
        duration: Duration,
    },

    TimerFired {
        timer: TimerRef,
    },

    ChildWorkflowStarted {
        child_id: u64,
        workflow_type: String,
        workflow_id: String,
        run_id: RunId,
        input: Value,
        options: ChildWorkflowOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        compensation: Option<CompensationRef>,
    },

    ChildWorkflowCompleted {
        child_id: u64,
        result: Value,
    },

    ChildWorkflowFailed {
        child_id: u64,
        failure: WorkflowFailure,
    },

    SignalReceived {
        name: String,
        payload: Value,
    },

    CancelRequested {
        reason: String,
    },

    /// The single transition of the compensation stack into unwinding.
    CompensationStarted {
        cause: UnwindCause,
    },

    WorkflowCompleted {
        result: Value,
    },

    WorkflowFailed {
        failure: WorkflowFailure,
        /// The run that continues this execution under workflow-level retry.
        #[serde(default)]
        next_run: Option<RunId>,
    },

    WorkflowTimedOut {
        failure: WorkflowFailure,
    },

    WorkflowCancelled {
        reason: String,
        /// True when the run was closed by its parent's close policy.
        #[serde(default)]
        terminated: bool,
        #[serde(default)]
        compensation: Option<CompensationReport>,
    },
}

impl WorkflowEvent {
    /// Returns the event type name stored alongside the payload.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "WorkflowStarted",
            WorkflowEvent::ActivityScheduled(_) => "ActivityScheduled",
            WorkflowEvent::ActivityAttemptFailed { .. } => "ActivityAttemptFailed",
            WorkflowEvent::ActivityCompleted { .. } => "ActivityCompleted",
            WorkflowEvent::ActivityFailed { .. } => "ActivityFailed",
            WorkflowEvent::TimerStarted { .. } => "TimerStarted",
            WorkflowEvent::TimerFired { .. } => "TimerFired",
            WorkflowEvent::ChildWorkflowStarted { .. } => "ChildWorkflowStarted",
            WorkflowEvent::ChildWorkflowCompleted { .. } => "ChildWorkflowCompleted",
            WorkflowEvent::ChildWorkflowFailed { .. } => "ChildWorkflowFailed",
            WorkflowEvent::SignalReceived { .. } => "SignalReceived",
            WorkflowEvent::CancelRequested { .. } => "CancelRequested",
            WorkflowEvent::CompensationStarted { .. } => "CompensationStarted",
            WorkflowEvent::WorkflowCompleted { .. } => "WorkflowCompleted",
            WorkflowEvent::WorkflowFailed { .. } => "WorkflowFailed",
            WorkflowEvent::WorkflowTimedOut { .. } => "WorkflowTimedOut",
            WorkflowEvent::WorkflowCancelled { .. } => "WorkflowCancelled",
        }
    }

    /// Returns true for events that close a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::WorkflowCompleted { .. }
                | WorkflowEvent::WorkflowFailed { .. }
                | WorkflowEvent::WorkflowTimedOut { .. }
                | WorkflowEvent::WorkflowCancelled { .. }
        )
    }
}

/// A workflow event at its position in history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEvent {
    pub sequence: SequenceNo,
    pub timestamp: DateTime<Utc>,
    pub event: WorkflowEvent,
}

impl HistoryEvent {
    pub fn new(sequence: SequenceNo, timestamp: DateTime<Utc>, event: WorkflowEvent) -> Self {
        Self {
            sequence,
            timestamp,
            event,
        }
    }

    /// Decodes a stored envelope.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        let event = serde_json::from_value(envelope.payload.clone())?;
        Ok(Self {
            sequence: envelope.sequence,
            timestamp: envelope.timestamp,
            event,
        })
    }

    /// Decodes a whole stored history.
    pub fn from_envelopes(envelopes: &[EventEnvelope]) -> Result<Vec<Self>> {
        envelopes.iter().map(Self::from_envelope).collect()
    }

    /// Encodes the event for appending to the given execution's history.
    pub fn to_envelope(&self, execution: &ExecutionKey) -> Result<EventEnvelope> {
        let envelope = EventEnvelope::builder()
            .event_type(self.event.event_type())
            .execution(execution.clone())
            .sequence(self.sequence)
            .timestamp(self.timestamp)
            .payload(&self.event)?
            .build()?;
        Ok(envelope)
    }
}
