use chrono::{DateTime, Utc};
use common::{RunId, WorkflowId};

use crate::{ExecutionKey, SequenceNo};

/// Builder for constructing event queries.
///
/// Allows filtering events by workflow ID, run ID, event type, sequence
/// range and time range.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Filter by workflow ID (all runs).
    pub workflow_id: Option<WorkflowId>,

    /// Filter by run ID.
    pub run_id: Option<RunId>,

    /// Filter by event types (any of these types).
    pub event_types: Option<Vec<String>>,

    /// Filter by minimum sequence (inclusive).
    pub from_sequence: Option<SequenceNo>,

    /// Filter by maximum sequence (inclusive).
    pub to_sequence: Option<SequenceNo>,

    /// Filter by events after this timestamp (inclusive).
    pub from_timestamp: Option<DateTime<Utc>>,

    /// Filter by events before this timestamp (inclusive).
    pub to_timestamp: Option<DateTime<Utc>>,

    /// Maximum number of events to return.
    pub limit: Option<usize>,

    /// Number of events to skip.
    pub offset: Option<usize>,
}

impl EventQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for one execution.
    pub fn for_execution(execution: &ExecutionKey) -> Self {
        Self {
            workflow_id: Some(execution.workflow_id.clone()),
            run_id: Some(execution.run_id),
            ..Default::default()
        }
    }

    /// Creates a query for every run of a workflow ID.
    pub fn for_workflow(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow_id: Some(workflow_id.into()),
            ..Default::default()
        }
    }

    /// Creates a query for events of a specific type.
    pub fn for_event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_types: Some(vec![event_type.into()]),
            ..Default::default()
        }
    }

    /// Filters by workflow ID.
    pub fn workflow_id(mut self, id: impl Into<WorkflowId>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    /// Filters by run ID.
    pub fn run_id(mut self, id: RunId) -> Self {
        self.run_id = Some(id);
        self
    }

    /// Filters by event type.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types = Some(vec![event_type.into()]);
        self
    }

    /// Filters by multiple event types (any of these).
    pub fn event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// Filters to events starting from this sequence (inclusive).
    pub fn from_sequence(mut self, sequence: SequenceNo) -> Self {
        self.from_sequence = Some(sequence);
        self
    }

    /// Filters to events up to this sequence (inclusive).
    pub fn to_sequence(mut self, sequence: SequenceNo) -> Self {
        self.to_sequence = Some(sequence);
        self
    }

    /// Filters to events after this timestamp (inclusive).
    pub fn from_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.from_timestamp = Some(timestamp);
        self
    }

    /// Filters to events before this timestamp (inclusive).
    pub fn to_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.to_timestamp = Some(timestamp);
        self
    }

    /// Limits the number of events returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skips this many events before returning results.
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if `event` passes every filter except limit/offset.
    pub fn matches(&self, event: &crate::EventEnvelope) -> bool {
        if let Some(ref id) = self.workflow_id
            && &event.execution.workflow_id != id
        {
            return false;
        }
        if let Some(run_id) = self.run_id
            && event.execution.run_id != run_id
        {
            return false;
        }
        if let Some(ref types) = self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(from) = self.from_sequence
            && event.sequence < from
        {
            return false;
        }
        if let Some(to) = self.to_sequence
            && event.sequence > to
        {
            return false;
        }
        if let Some(from) = self.from_timestamp
            && event.timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to_timestamp
            && event.timestamp > to
        {
            return false;
        }
        true
    }
}
