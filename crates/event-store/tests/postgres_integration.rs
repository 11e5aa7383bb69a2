//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p event-store --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use common::RunId;
use event_store::{
    AppendOptions, EventEnvelope, EventQuery, EventStore, EventStoreError, EventStoreExt,
    ExecutionKey, PostgresEventStore, SequenceNo,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_workflow_events_table.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with its own pool and a cleared table
async fn get_test_store() -> PostgresEventStore {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE workflow_events")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventStore::new(pool)
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
        .payload_raw(serde_json::json!({"type": event_type}))
        .build()
        .unwrap()
}

#[tokio::test]
#[serial]
async fn append_and_read_history() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-1", RunId::new());

    let event = create_test_event(&key, SequenceNo::first(), "WorkflowStarted");
    let result = store.append(vec![event], AppendOptions::expect_new()).await;
    assert_eq!(result.unwrap(), SequenceNo::first());

    let events = store.read_history(&key).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "WorkflowStarted");
    assert_eq!(events[0].execution, key);
    assert_eq!(events[0].sequence, SequenceNo::first());
}

#[tokio::test]
#[serial]
async fn append_batch_atomically() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-2", RunId::new());

    let events = vec![
        create_test_event(&key, SequenceNo::new(1), "WorkflowStarted"),
        create_test_event(&key, SequenceNo::new(2), "ActivityScheduled"),
        create_test_event(&key, SequenceNo::new(3), "TimerStarted"),
    ];

    let result = store.append(events, AppendOptions::expect_new()).await;
    assert_eq!(result.unwrap(), SequenceNo::new(3));

    let stored = store.read_history(&key).await.unwrap();
    let sequences: Vec<i64> = stored.iter().map(|e| e.sequence.as_i64()).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
#[serial]
async fn stale_writer_gets_conflict() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-3", RunId::new());

    store
        .append(
            vec![create_test_event(&key, SequenceNo::first(), "WorkflowStarted")],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    store
        .append(
            vec![create_test_event(&key, SequenceNo::new(2), "ActivityScheduled")],
            AppendOptions::expect_sequence(SequenceNo::first()),
        )
        .await
        .unwrap();

    // Writer that replayed only the first event
    let result = store
        .append(
            vec![create_test_event(&key, SequenceNo::new(2), "TimerStarted")],
            AppendOptions::expect_sequence(SequenceNo::first()),
        )
        .await;

    match result {
        Err(EventStoreError::ConcurrentAppendConflict {
            expected, actual, ..
        }) => {
            assert_eq!(expected, SequenceNo::first());
            assert_eq!(actual, SequenceNo::new(2));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    assert_eq!(store.read_history(&key).await.unwrap().len(), 2);
}

#[tokio::test]
#[serial]
async fn unique_constraint_catches_unchecked_duplicate() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-4", RunId::new());

    store
        .append(
            vec![create_test_event(&key, SequenceNo::first(), "WorkflowStarted")],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let result = store
        .append(
            vec![create_test_event(&key, SequenceNo::first(), "WorkflowStarted")],
            AppendOptions::new(),
        )
        .await;

    assert!(result.unwrap_err().is_conflict());
}

#[tokio::test]
#[serial]
async fn runs_of_same_workflow_are_separate_histories() {
    let store = get_test_store().await;
    let first = ExecutionKey::new("order-workflow-5", RunId::new());
    let second = ExecutionKey::new("order-workflow-5", RunId::new());

    for key in [&first, &second] {
        store
            .append(
                vec![create_test_event(key, SequenceNo::first(), "WorkflowStarted")],
                AppendOptions::expect_new(),
            )
            .await
            .unwrap();
    }

    assert_eq!(store.read_history(&first).await.unwrap().len(), 1);
    assert_eq!(store.read_history(&second).await.unwrap().len(), 1);

    let all_runs = store
        .query_events(EventQuery::for_workflow("order-workflow-5"))
        .await
        .unwrap();
    assert_eq!(all_runs.len(), 2);
}

#[tokio::test]
#[serial]
async fn read_history_from_sequence() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-6", RunId::new());

    let events = (1..=5)
        .map(|s| create_test_event(&key, SequenceNo::new(s), "TimerFired"))
        .collect();
    store.append(events, AppendOptions::new()).await.unwrap();

    let tail = store
        .read_history_from(&key, SequenceNo::new(3))
        .await
        .unwrap();
    assert_eq!(tail.len(), 3);
    assert_eq!(tail[0].sequence, SequenceNo::new(3));
}

#[tokio::test]
#[serial]
async fn query_by_type_with_pagination() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-7", RunId::new());

    store
        .append(
            vec![
                create_test_event(&key, SequenceNo::new(1), "WorkflowStarted"),
                create_test_event(&key, SequenceNo::new(2), "ActivityScheduled"),
                create_test_event(&key, SequenceNo::new(3), "ActivityCompleted"),
                create_test_event(&key, SequenceNo::new(4), "ActivityScheduled"),
            ],
            AppendOptions::new(),
        )
        .await
        .unwrap();

    let scheduled = store
        .query_events(EventQuery::for_execution(&key).event_type("ActivityScheduled"))
        .await
        .unwrap();
    assert_eq!(scheduled.len(), 2);

    let page = store
        .query_events(EventQuery::for_execution(&key).limit(2).offset(1))
        .await
        .unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].sequence, SequenceNo::new(2));
}

#[tokio::test]
#[serial]
async fn list_and_purge_executions() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-8", RunId::new());

    assert!(!store.execution_exists(&key).await.unwrap());

    store
        .append(
            vec![
                create_test_event(&key, SequenceNo::new(1), "WorkflowStarted"),
                create_test_event(&key, SequenceNo::new(2), "WorkflowCompleted"),
            ],
            AppendOptions::expect_new(),
        )
        .await
        .unwrap();

    assert!(store.execution_exists(&key).await.unwrap());
    assert_eq!(
        store.last_sequence(&key).await.unwrap(),
        Some(SequenceNo::new(2))
    );
    assert_eq!(store.list_executions().await.unwrap(), vec![key.clone()]);

    assert_eq!(store.purge_execution(&key).await.unwrap(), 2);
    assert!(store.list_executions().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn metadata_round_trips_through_jsonb() {
    let store = get_test_store().await;
    let key = ExecutionKey::new("order-workflow-9", RunId::new());

    let event = EventEnvelope::builder()
        .execution(key.clone())
        .event_type("WorkflowStarted")
        .sequence(SequenceNo::first())
        .payload_raw(serde_json::json!({"input": {"order_id": "o-1"}}))
        .metadata("driver", serde_json::json!("driver-2"))
        .build()
        .unwrap();

    store
        .append(vec![event], AppendOptions::expect_new())
        .await
        .unwrap();

    let stored = store.read_history(&key).await.unwrap();
    assert_eq!(
        stored[0].metadata.get("driver"),
        Some(&serde_json::json!("driver-2"))
    );
    assert_eq!(stored[0].payload["input"]["order_id"], "o-1");
}
