//! Workflow error types.

use event_store::EventStoreError;
use saga::SagaError;
use thiserror::Error;

/// Errors raised while folding history or replaying workflow code.
///
/// These are engine errors. Business failures of a workflow are
/// [`WorkflowFailure`](crate::WorkflowFailure) values and end up in history.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Workflow code asked for something that does not match its recorded history.
    #[error("Nondeterminism at command {command_id}: {message}")]
    Nondeterminism { command_id: u64, message: String },

    /// The stored history cannot be folded.
    #[error("Corrupt history: {0}")]
    CorruptHistory(String),

    /// The compensation stack rejected an event.
    #[error("Saga error: {0}")]
    Saga(#[from] SagaError),

    /// No definition is registered under the requested workflow type.
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// An error occurred in the event store.
    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl WorkflowError {
    pub fn corrupt(message: impl Into<String>) -> Self {
        WorkflowError::CorruptHistory(message.into())
    }
}

/// Convenience type alias for workflow results.
pub type Result<T> = std::result::Result<T, WorkflowError>;
