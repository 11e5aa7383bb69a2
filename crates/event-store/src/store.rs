use async_trait::async_trait;

use crate::{EventEnvelope, EventQuery, EventStoreError, ExecutionKey, Result, SequenceNo};

/// Options for appending events to the store.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected last sequence of the execution for optimistic concurrency control.
    /// If None, no check is performed (use with caution).
    pub expected_sequence: Option<SequenceNo>,
}

impl AppendOptions {
    /// Creates options with no sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the history to end at `sequence`.
    pub fn expect_sequence(sequence: SequenceNo) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Creates options expecting the execution to not exist yet.
    pub fn expect_new() -> Self {
        Self {
            expected_sequence: Some(SequenceNo::initial()),
        }
    }
}

/// Core trait for history store implementations.
///
/// All implementations must be thread-safe (Send + Sync). A successful
/// `append` is durable: the engine dispatches the commands derived from a
/// pass only after the pass's events were appended.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends a batch of events to one execution.
    ///
    /// The batch is atomic - either all events are stored or none are.
    /// If `options.expected_sequence` is set and does not match the current
    /// last sequence, fails with `ConcurrentAppendConflict`.
    ///
    /// Returns the sequence of the last appended event.
    async fn append(&self, events: Vec<EventEnvelope>, options: AppendOptions)
    -> Result<SequenceNo>;

    /// Reads the full history of an execution in sequence order.
    ///
    /// Returns an empty vector for an execution that has no events.
    async fn read_history(&self, execution: &ExecutionKey) -> Result<Vec<EventEnvelope>>;

    /// Reads the history starting from a sequence number (inclusive).
    async fn read_history_from(
        &self,
        execution: &ExecutionKey,
        from_sequence: SequenceNo,
    ) -> Result<Vec<EventEnvelope>>;

    /// Retrieves events matching a query.
    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>>;

    /// Returns the last sequence of an execution, None if it has no events.
    async fn last_sequence(&self, execution: &ExecutionKey) -> Result<Option<SequenceNo>>;

    /// Lists every execution that has at least one event.
    async fn list_executions(&self) -> Result<Vec<ExecutionKey>>;

    /// Removes an execution's history. Used once a closed execution has
    /// outlived its retention window.
    ///
    /// Returns the number of events removed.
    async fn purge_execution(&self, execution: &ExecutionKey) -> Result<u64>;
}

/// Extension trait providing convenience methods for event stores.
#[async_trait]
pub trait EventStoreExt: EventStore {
    /// Appends a single event to the store.
    async fn append_event(
        &self,
        event: EventEnvelope,
        options: AppendOptions,
    ) -> Result<SequenceNo> {
        self.append(vec![event], options).await
    }

    /// Checks if an execution exists (has any events).
    async fn execution_exists(&self, execution: &ExecutionKey) -> Result<bool> {
        Ok(self.last_sequence(execution).await?.is_some())
    }
}

// Blanket implementation for all EventStore implementations
impl<T: EventStore + ?Sized> EventStoreExt for T {}

/// Validates a batch before appending.
///
/// All events must target the same execution and carry contiguous sequence
/// numbers; when an expected sequence is given, the batch must start right
/// after it.
pub fn validate_events_for_append(
    events: &[EventEnvelope],
    options: &AppendOptions,
) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(EventStoreError::InvalidAppend(
            "Cannot append empty event list".to_string(),
        ));
    };

    if events.iter().any(|e| e.execution != first.execution) {
        return Err(EventStoreError::InvalidAppend(
            "All events must be for the same execution".to_string(),
        ));
    }

    if let Some(expected) = options.expected_sequence
        && first.sequence != expected.next()
    {
        return Err(EventStoreError::InvalidAppend(format!(
            "First event must have sequence {}, got {}",
            expected.next(),
            first.sequence
        )));
    }

    let mut expected_sequence = first.sequence;
    for event in events.iter().skip(1) {
        expected_sequence = expected_sequence.next();
        if event.sequence != expected_sequence {
            return Err(EventStoreError::InvalidAppend(format!(
                "Event sequences must be contiguous. Expected {}, got {}",
                expected_sequence, event.sequence
            )));
        }
    }

    Ok(())
}
