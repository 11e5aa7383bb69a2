use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    EventEnvelope, EventQuery, EventStoreError, ExecutionKey, Result, SequenceNo,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

/// In-memory event store implementation.
///
/// Used by tests and by the binary when no database is configured. It
/// provides the same guarantees as the PostgreSQL implementation except
/// durability across process restarts; cloning shares the same history, so
/// a "restarted" runtime can be pointed at a clone to exercise recovery.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    histories: Arc<RwLock<HashMap<ExecutionKey, Vec<EventEnvelope>>>>,
}

impl InMemoryEventStore {
    /// Creates a new empty in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events stored.
    pub async fn event_count(&self) -> usize {
        self.histories.read().await.values().map(Vec::len).sum()
    }

    /// Clears all histories.
    pub async fn clear(&self) {
        self.histories.write().await.clear();
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceNo> {
        validate_events_for_append(&events, &options)?;

        let execution = events[0].execution.clone();
        let mut histories = self.histories.write().await;
        let history = histories.entry(execution.clone()).or_default();

        let current = history
            .last()
            .map(|e| e.sequence)
            .unwrap_or(SequenceNo::initial());

        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(EventStoreError::ConcurrentAppendConflict {
                execution,
                expected,
                actual: current,
            });
        }

        // Unique (execution, sequence) constraint simulation
        if events[0].sequence <= current {
            return Err(EventStoreError::ConcurrentAppendConflict {
                execution,
                expected: options.expected_sequence.unwrap_or(current),
                actual: current,
            });
        }

        let last = events
            .last()
            .map(|e| e.sequence)
            .unwrap_or(SequenceNo::initial());
        history.extend(events);

        metrics::counter!("event_store_appends_total").increment(1);
        Ok(last)
    }

    async fn read_history(&self, execution: &ExecutionKey) -> Result<Vec<EventEnvelope>> {
        let histories = self.histories.read().await;
        Ok(histories.get(execution).cloned().unwrap_or_default())
    }

    async fn read_history_from(
        &self,
        execution: &ExecutionKey,
        from_sequence: SequenceNo,
    ) -> Result<Vec<EventEnvelope>> {
        let histories = self.histories.read().await;
        Ok(histories
            .get(execution)
            .map(|history| {
                history
                    .iter()
                    .filter(|e| e.sequence >= from_sequence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let histories = self.histories.read().await;
        let mut events: Vec<_> = histories
            .values()
            .flatten()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();

        // Sort by timestamp then sequence
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.sequence.cmp(&b.sequence))
        });

        let offset = query.offset.unwrap_or(0);
        let events = events.into_iter().skip(offset);
        let events = match query.limit {
            Some(limit) => events.take(limit).collect(),
            None => events.collect(),
        };

        Ok(events)
    }

    async fn last_sequence(&self, execution: &ExecutionKey) -> Result<Option<SequenceNo>> {
        let histories = self.histories.read().await;
        Ok(histories
            .get(execution)
            .and_then(|history| history.last())
            .map(|e| e.sequence))
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionKey>> {
        let histories = self.histories.read().await;
        let mut keys: Vec<_> = histories
            .iter()
            .filter(|(_, history)| !history.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn purge_execution(&self, execution: &ExecutionKey) -> Result<u64> {
        let mut histories = self.histories.write().await;
        Ok(histories
            .remove(execution)
            .map(|history| history.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::RunId;

    fn execution() -> ExecutionKey {
        ExecutionKey::new("order-workflow-1", RunId::new())
    }

    fn create_test_event(
        execution: &ExecutionKey,
        sequence: SequenceNo,
        event_type: &str,
    ) -> EventEnvelope {
        EventEnvelope::builder()
            .execution(execution.clone())
            .event_type(event_type)
            .sequence(sequence)
            .payload_raw(serde_json::json!({"test": true}))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn append_single_event() {
        let store = InMemoryEventStore::new();
        let key = execution();
        let event = create_test_event(&key, SequenceNo::first(), "WorkflowStarted");

        let result = store.append(vec![event], AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), SequenceNo::first());

        let events = store.read_history(&key).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn append_multiple_events() {
        let store = InMemoryEventStore::new();
        let key = execution();

        let events = vec![
            create_test_event(&key, SequenceNo::new(1), "WorkflowStarted"),
            create_test_event(&key, SequenceNo::new(2), "ActivityScheduled"),
            create_test_event(&key, SequenceNo::new(3), "TimerStarted"),
        ];

        let result = store.append(events, AppendOptions::expect_new()).await;
        assert_eq!(result.unwrap(), SequenceNo::new(3));

        let stored = store.read_history(&key).await.unwrap();
        assert_eq!(stored.len(), 3);
        assert_eq!(store.event_count().await, 3);
    }

    #[tokio::test]
    async fn read_history_of_unknown_execution_is_empty() {
        let store = InMemoryEventStore::new();
        let events = store.read_history(&execution()).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn conflict_on_stale_expected_sequence() {
        let store = InMemoryEventStore::new();
        let key = execution();

        store
            .append(
                vec![create_test_event(&key, SequenceNo::first(), "WorkflowStarted")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        // Second writer still believes the history is empty
        let result = store
            .append(
                vec![create_test_event(&key, SequenceNo::first(), "WorkflowStarted")],
                AppendOptions::expect_new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrentAppendConflict { .. })
        ));
        assert_eq!(store.read_history(&key).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn append_with_matching_expected_sequence() {
        let store = InMemoryEventStore::new();
        let key = execution();

        store
            .append(
                vec![create_test_event(&key, SequenceNo::first(), "WorkflowStarted")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();

        let result = store
            .append(
                vec![create_test_event(&key, SequenceNo::new(2), "ActivityScheduled")],
                AppendOptions::expect_sequence(SequenceNo::first()),
            )
            .await;

        assert_eq!(result.unwrap(), SequenceNo::new(2));
    }

    #[tokio::test]
    async fn read_history_from_sequence() {
        let store = InMemoryEventStore::new();
        let key = execution();

        let events = vec![
            create_test_event(&key, SequenceNo::new(1), "WorkflowStarted"),
            create_test_event(&key, SequenceNo::new(2), "ActivityScheduled"),
            create_test_event(&key, SequenceNo::new(3), "ActivityCompleted"),
        ];
        store.append(events, AppendOptions::new()).await.unwrap();

        let from_2 = store
            .read_history_from(&key, SequenceNo::new(2))
            .await
            .unwrap();
        assert_eq!(from_2.len(), 2);
        assert_eq!(from_2[0].sequence, SequenceNo::new(2));
        assert_eq!(from_2[1].sequence, SequenceNo::new(3));
    }

    #[tokio::test]
    async fn query_events_by_workflow_and_type() {
        let store = InMemoryEventStore::new();
        let first_run = ExecutionKey::new("order-1", RunId::new());
        let second_run = ExecutionKey::new("order-1", RunId::new());
        let other = ExecutionKey::new("order-2", RunId::new());

        for key in [&first_run, &second_run, &other] {
            store
                .append(
                    vec![
                        create_test_event(key, SequenceNo::new(1), "WorkflowStarted"),
                        create_test_event(key, SequenceNo::new(2), "ActivityScheduled"),
                    ],
                    AppendOptions::expect_new(),
                )
                .await
                .unwrap();
        }

        let starts = store
            .query_events(EventQuery::for_workflow("order-1").event_type("WorkflowStarted"))
            .await
            .unwrap();
        assert_eq!(starts.len(), 2);

        let limited = store
            .query_events(EventQuery::new().limit(1).offset(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn last_sequence_and_listing() {
        let store = InMemoryEventStore::new();
        let key = execution();

        assert!(store.last_sequence(&key).await.unwrap().is_none());

        store
            .append(
                vec![
                    create_test_event(&key, SequenceNo::new(1), "WorkflowStarted"),
                    create_test_event(&key, SequenceNo::new(2), "TimerStarted"),
                ],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            store.last_sequence(&key).await.unwrap(),
            Some(SequenceNo::new(2))
        );
        assert_eq!(store.list_executions().await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn purge_removes_history() {
        let store = InMemoryEventStore::new();
        let key = execution();

        store
            .append(
                vec![create_test_event(&key, SequenceNo::first(), "WorkflowStarted")],
                AppendOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(store.purge_execution(&key).await.unwrap(), 1);
        assert!(store.read_history(&key).await.unwrap().is_empty());
        assert!(store.list_executions().await.unwrap().is_empty());
        assert_eq!(store.purge_execution(&key).await.unwrap(), 0);
    }
}
