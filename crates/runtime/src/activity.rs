//! Activity implementations and the registry in-process workers run them from.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ActivityError, ActivityTaskId};
use serde_json::Value;

use crate::runtime::Engine;
use crate::task::ActivityTask;

/// A unit of side-effecting work.
///
/// Activities run at least once: an attempt may be re-executed after a
/// crash or a timeout even if it already took effect, so implementations
/// should be idempotent.
#[async_trait]
pub trait Activity: Send + Sync {
    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError>;
}

/// Handle passed to a running attempt.
#[derive(Clone)]
pub struct ActivityContext {
    task_id: ActivityTaskId,
    activity_type: String,
    engine: Arc<Engine>,
}

impl ActivityContext {
    pub(crate) fn new(engine: Arc<Engine>, task: &ActivityTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            activity_type: task.activity_type.clone(),
            engine,
        }
    }

    pub fn task_id(&self) -> &ActivityTaskId {
        &self.task_id
    }

    pub fn activity_type(&self) -> &str {
        &self.activity_type
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.task_id.attempt
    }

    /// Reports progress. Returns false once the attempt is no longer
    /// tracked, typically because it already timed out.
    pub async fn heartbeat(&self) -> bool {
        self.engine.heartbeat_activity_task(&self.task_id).await
    }
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("task_id", &self.task_id)
            .field("activity_type", &self.activity_type)
            .finish()
    }
}

/// Adapts an async closure into an [`Activity`].
pub struct FnActivity<F> {
    f: F,
}

impl<F> FnActivity<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ActivityError>> + Send,
{
    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        (self.f)(ctx, input).await
    }
}

/// Activity implementations by name.
#[derive(Clone, Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A>(&mut self, name: impl Into<String>, activity: A) -> &mut Self
    where
        A: Activity + 'static,
    {
        self.activities.insert(name.into(), Arc::new(activity));
        self
    }

    /// Registers an async closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ActivityError>> + Send + 'static,
    {
        self.register(name, FnActivity::new(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.activities.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.activities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl std::fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activities", &self.names())
            .finish()
    }
}
