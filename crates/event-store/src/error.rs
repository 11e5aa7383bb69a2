use thiserror::Error;

use crate::{ExecutionKey, SequenceNo};

/// Errors that can occur when interacting with the event store.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Another writer appended to the execution first.
    /// The caller's expected last sequence did not match the stored one.
    #[error(
        "Concurrent append conflict for execution {execution}: expected sequence {expected}, found {actual}"
    )]
    ConcurrentAppendConflict {
        execution: ExecutionKey,
        expected: SequenceNo,
        actual: SequenceNo,
    },

    /// The batch handed to `append` is malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventStoreError {
    /// Returns true for the optimistic-concurrency failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EventStoreError::ConcurrentAppendConflict { .. })
    }
}

/// Result type for event store operations.
pub type Result<T> = std::result::Result<T, EventStoreError>;
