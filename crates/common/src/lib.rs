//! Shared types for the saga workflow engine.

pub mod failure;
pub mod ids;
pub mod retry;

pub use failure::{
    ACTIVITY_TIMEOUT, ActivityError, ErrorClass, GENERIC_ERROR, HEARTBEAT_TIMEOUT,
    UNREGISTERED_ACTIVITY,
};
pub use ids::{ActivityTaskId, ExecutionKey, RunId, WorkflowId};
pub use retry::{RetryPolicy, RetryPolicyError};
