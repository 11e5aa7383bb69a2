//! Workflow definitions and the registry the runtime resolves them from.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::Poll;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::{Result, WorkflowError};
use crate::failure::WorkflowFailure;

/// Result returned by workflow code once it finishes.
pub type WorkflowResult = std::result::Result<Value, WorkflowFailure>;

/// How a run reacts to a recorded cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CancellationPolicy {
    /// Unwind the compensation stack, then record `WorkflowCancelled`.
    #[default]
    Compensate,
    /// Record `WorkflowCancelled` at once, without compensating.
    CancelImmediately,
    /// Keep running; the code decides via [`WorkflowContext::is_cancel_requested`].
    Ignore,
}

/// A workflow: deterministic code re-run from the start on every pass.
///
/// `execute` must depend only on what the context returns. It may not read
/// the clock, draw random numbers or perform I/O; all of that goes through
/// activities, timers and signals so that it is recorded in history.
pub trait WorkflowDefinition: Send + Sync {
    /// Workflow type name used to start executions.
    fn name(&self) -> &str;

    /// Runs the workflow code up to its first unresolved step.
    fn execute(&self, ctx: &mut WorkflowContext<'_>) -> Poll<WorkflowResult>;

    fn cancellation_policy(&self) -> CancellationPolicy {
        CancellationPolicy::Compensate
    }
}

/// Adapts a closure into a [`WorkflowDefinition`].
pub struct FnWorkflow<F> {
    name: String,
    cancellation_policy: CancellationPolicy,
    f: F,
}

impl<F> FnWorkflow<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut WorkflowContext<'_>) -> Poll<WorkflowResult> + Send + Sync,
    {
        Self {
            name: name.into(),
            cancellation_policy: CancellationPolicy::default(),
            f,
        }
    }

    pub fn with_cancellation_policy(mut self, policy: CancellationPolicy) -> Self {
        self.cancellation_policy = policy;
        self
    }
}

impl<F> WorkflowDefinition for FnWorkflow<F>
where
    F: Fn(&mut WorkflowContext<'_>) -> Poll<WorkflowResult> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: &mut WorkflowContext<'_>) -> Poll<WorkflowResult> {
        (self.f)(ctx)
    }

    fn cancellation_policy(&self) -> CancellationPolicy {
        self.cancellation_policy
    }
}

/// Workflow definitions by type name.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    definitions: HashMap<String, Arc<dyn WorkflowDefinition>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition under its name, replacing any previous one.
    pub fn register<D>(&mut self, definition: D) -> &mut Self
    where
        D: WorkflowDefinition + 'static,
    {
        self.register_arc(Arc::new(definition))
    }

    pub fn register_arc(&mut self, definition: Arc<dyn WorkflowDefinition>) -> &mut Self {
        self.definitions
            .insert(definition.name().to_string(), definition);
        self
    }

    pub fn get(&self, workflow_type: &str) -> Result<Arc<dyn WorkflowDefinition>> {
        self.definitions
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownWorkflowType(workflow_type.to_string()))
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.definitions.contains_key(workflow_type)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

impl std::fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("definitions", &self.names())
            .finish()
    }
}
