use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-chosen business identifier of a workflow (e.g. `order-workflow-42`).
///
/// Several runs may share one workflow ID over time (workflow-level retry),
/// but at most one of them is active at any instant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// Creates a workflow ID from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkflowId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WorkflowId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique identifier for one run of a workflow.
///
/// Wraps a UUID to provide type safety and prevent mixing up
/// run IDs with other UUID-based identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    /// Creates a new random run ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a run ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RunId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<RunId> for Uuid {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Identity of one workflow execution: `(workflow_id, run_id)`.
///
/// Every history, lock and queue entry in the engine is keyed by this value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub workflow_id: WorkflowId,
    pub run_id: RunId,
}

impl ExecutionKey {
    pub fn new(workflow_id: impl Into<WorkflowId>, run_id: RunId) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
        }
    }
}

impl std::fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.workflow_id, self.run_id)
    }
}

/// Identifier handed to activity workers for one attempt of one activity.
///
/// The attempt number is part of the identity, so a late completion from a
/// timed-out attempt can never resolve a newer attempt of the same activity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityTaskId {
    pub execution: ExecutionKey,
    pub activity_id: u64,
    pub attempt: u32,
}

impl ActivityTaskId {
    pub fn new(execution: ExecutionKey, activity_id: u64, attempt: u32) -> Self {
        Self {
            execution,
            activity_id,
            attempt,
        }
    }
}

impl std::fmt::Display for ActivityTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/activity-{}#{}",
            self.execution, self.activity_id, self.attempt
        )
    }
}
