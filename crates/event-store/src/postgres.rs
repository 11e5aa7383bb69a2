use std::collections::HashMap;

use async_trait::async_trait;
use common::{RunId, WorkflowId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    EventEnvelope, EventId, EventQuery, EventStoreError, ExecutionKey, Result, SequenceNo,
    store::{AppendOptions, EventStore, validate_events_for_append},
};

const SELECT_COLUMNS: &str =
    "SELECT id, event_type, workflow_id, run_id, sequence_no, timestamp, payload, metadata FROM workflow_events";

/// PostgreSQL-backed history store implementation.
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<EventEnvelope> {
        let metadata_json: serde_json::Value = row.try_get("metadata")?;
        let metadata: HashMap<String, serde_json::Value> = serde_json::from_value(metadata_json)?;

        Ok(EventEnvelope {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            execution: ExecutionKey {
                workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                run_id: RunId::from_uuid(row.try_get::<Uuid, _>("run_id")?),
            },
            sequence: SequenceNo::new(row.try_get("sequence_no")?),
            timestamp: row.try_get("timestamp")?,
            payload: row.try_get("payload")?,
            metadata,
        })
    }

    async fn current_sequence(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        execution: &ExecutionKey,
    ) -> Result<SequenceNo> {
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_no) FROM workflow_events WHERE workflow_id = $1 AND run_id = $2",
        )
        .bind(execution.workflow_id.as_str())
        .bind(execution.run_id.as_uuid())
        .fetch_one(&mut **tx)
        .await?;

        Ok(SequenceNo::new(current.unwrap_or(0)))
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> Result<SequenceNo> {
        validate_events_for_append(&events, &options)?;

        let execution = events[0].execution.clone();

        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_sequence {
            let actual = self.current_sequence(&mut tx, &execution).await?;
            if actual != expected {
                return Err(EventStoreError::ConcurrentAppendConflict {
                    execution,
                    expected,
                    actual,
                });
            }
        }

        let mut last_sequence = SequenceNo::initial();
        for event in &events {
            let metadata_json = serde_json::to_value(&event.metadata)?;

            sqlx::query(
                r#"
                INSERT INTO workflow_events (id, event_type, workflow_id, run_id, sequence_no, timestamp, payload, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.execution.workflow_id.as_str())
            .bind(event.execution.run_id.as_uuid())
            .bind(event.sequence.as_i64())
            .bind(event.timestamp)
            .bind(&event.payload)
            .bind(metadata_json)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A racing writer inserted the same sequence between our check and insert
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_execution_sequence")
                {
                    return EventStoreError::ConcurrentAppendConflict {
                        execution: execution.clone(),
                        expected: options.expected_sequence.unwrap_or(SequenceNo::initial()),
                        actual: event.sequence,
                    };
                }
                EventStoreError::Database(e)
            })?;

            last_sequence = event.sequence;
        }

        tx.commit().await?;

        metrics::counter!("event_store_appends_total").increment(1);
        tracing::trace!(%execution, sequence = %last_sequence, "appended history batch");
        Ok(last_sequence)
    }

    async fn read_history(&self, execution: &ExecutionKey) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE workflow_id = $1 AND run_id = $2 ORDER BY sequence_no ASC"
        ))
        .bind(execution.workflow_id.as_str())
        .bind(execution.run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn read_history_from(
        &self,
        execution: &ExecutionKey,
        from_sequence: SequenceNo,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE workflow_id = $1 AND run_id = $2 AND sequence_no >= $3 ORDER BY sequence_no ASC"
        ))
        .bind(execution.workflow_id.as_str())
        .bind(execution.run_id.as_uuid())
        .bind(from_sequence.as_i64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn query_events(&self, query: EventQuery) -> Result<Vec<EventEnvelope>> {
        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.workflow_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND workflow_id = ${param_count}"));
        }
        if query.run_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND run_id = ${param_count}"));
        }
        if query.event_types.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND event_type = ANY(${param_count})"));
        }
        if query.from_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence_no >= ${param_count}"));
        }
        if query.to_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND sequence_no <= ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND timestamp <= ${param_count}"));
        }

        sql.push_str(" ORDER BY timestamp ASC, sequence_no ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.workflow_id {
            sqlx_query = sqlx_query.bind(id.as_str().to_string());
        }
        if let Some(run_id) = query.run_id {
            sqlx_query = sqlx_query.bind(run_id.as_uuid());
        }
        if let Some(event_types) = query.event_types {
            sqlx_query = sqlx_query.bind(event_types);
        }
        if let Some(from_sequence) = query.from_sequence {
            sqlx_query = sqlx_query.bind(from_sequence.as_i64());
        }
        if let Some(to_sequence) = query.to_sequence {
            sqlx_query = sqlx_query.bind(to_sequence.as_i64());
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn last_sequence(&self, execution: &ExecutionKey) -> Result<Option<SequenceNo>> {
        let sequence: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_no) FROM workflow_events WHERE workflow_id = $1 AND run_id = $2",
        )
        .bind(execution.workflow_id.as_str())
        .bind(execution.run_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(sequence.map(SequenceNo::new))
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionKey>> {
        let rows = sqlx::query(
            "SELECT DISTINCT workflow_id, run_id FROM workflow_events ORDER BY workflow_id, run_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ExecutionKey {
                    workflow_id: WorkflowId::new(row.try_get::<String, _>("workflow_id")?),
                    run_id: RunId::from_uuid(row.try_get::<Uuid, _>("run_id")?),
                })
            })
            .collect()
    }

    async fn purge_execution(&self, execution: &ExecutionKey) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM workflow_events WHERE workflow_id = $1 AND run_id = $2")
                .bind(execution.workflow_id.as_str())
                .bind(execution.run_id.as_uuid())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected())
    }
}
