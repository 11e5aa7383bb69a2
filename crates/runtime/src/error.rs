use common::{ExecutionKey, RetryPolicyError, RunId};
use event_store::EventStoreError;
use thiserror::Error;
use workflow::WorkflowError;

/// Errors surfaced by the runtime and its client.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A run with the same workflow id is still open.
    #[error("Workflow {workflow_id} is already running as run {run_id}")]
    AlreadyRunning { workflow_id: String, run_id: RunId },

    /// No history exists for the execution.
    #[error("Execution not found: {0}")]
    NotFound(ExecutionKey),

    /// The execution already reached a terminal state.
    #[error("Execution {0} is closed")]
    ExecutionClosed(ExecutionKey),

    /// The workflow exposes no value under this query name.
    #[error("Unknown query {name} for execution {execution}")]
    UnknownQuery { execution: ExecutionKey, name: String },

    /// Every append attempt lost the optimistic-concurrency race.
    #[error("Gave up appending to {execution} after {attempts} conflicting attempts")]
    AppendContention { execution: ExecutionKey, attempts: u32 },

    /// Waiting for a result took longer than the caller allowed.
    #[error("Timed out waiting for execution {0}")]
    Timeout(ExecutionKey),

    /// The runtime is shutting down and no longer accepts work.
    #[error("Runtime is shutting down")]
    ShuttingDown,

    #[error("Invalid retry policy: {0}")]
    InvalidRetryPolicy(#[from] RetryPolicyError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Returns true if a retry with fresh history may succeed.
    pub fn is_conflict(&self) -> bool {
        match self {
            RuntimeError::EventStore(err) => err.is_conflict(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
