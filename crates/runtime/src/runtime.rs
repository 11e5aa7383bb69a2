//! Runtime assembly: the shared engine, its background tasks and shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use common::{ActivityError, ActivityTaskId, ExecutionKey};
use event_store::EventStore;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;
use workflow::{WorkflowDefinition, WorkflowRegistry};

use crate::activity::{Activity, ActivityContext, ActivityRegistry};
use crate::client::{ActivityTaskClient, WorkflowClient};
use crate::config::RuntimeOptions;
use crate::dispatch::InFlight;
use crate::error::Result;
use crate::queue::{ActivityQueues, WorkflowQueue};
use crate::recovery::RecoveryReport;
use crate::timer::{TimerHandle, TimerService};

/// State shared by the runtime's background tasks and its clients.
pub(crate) struct Engine {
    pub store: Arc<dyn EventStore>,
    pub workflows: WorkflowRegistry,
    pub activities: ActivityRegistry,
    pub options: RuntimeOptions,
    pub workflow_queue: WorkflowQueue,
    pub activity_queues: ActivityQueues,
    pub in_flight: Mutex<HashMap<ActivityTaskId, InFlight>>,
    pub timers: TimerHandle,
    /// Serializes transactions on one execution within this process.
    pub locks: Mutex<HashMap<ExecutionKey, Arc<Mutex<()>>>>,
    /// Serializes starts so that a workflow id has at most one open run.
    pub start_lock: Mutex<()>,
    /// Bumped every time a run closes; result waiters watch it.
    pub closed: watch::Sender<u64>,
    pub shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflows", &self.workflows)
            .field("activities", &self.activities)
            .field("options", &self.options)
            .finish()
    }
}

/// Configures and starts a [`Runtime`].
pub struct RuntimeBuilder {
    store: Arc<dyn EventStore>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
    options: RuntimeOptions,
}

impl RuntimeBuilder {
    pub fn workflow<D>(mut self, definition: D) -> Self
    where
        D: WorkflowDefinition + 'static,
    {
        self.workflows.register(definition);
        self
    }

    pub fn workflows(mut self, workflows: WorkflowRegistry) -> Self {
        self.workflows = workflows;
        self
    }

    pub fn activity<A>(mut self, name: impl Into<String>, activity: A) -> Self
    where
        A: Activity + 'static,
    {
        self.activities.register(name, activity);
        self
    }

    pub fn activity_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, ActivityError>> + Send + 'static,
    {
        self.activities.register_fn(name, f);
        self
    }

    pub fn activities(mut self, activities: ActivityRegistry) -> Self {
        self.activities = activities;
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Recovers every execution found in the store, then starts the
    /// workflow workers, activity workers, timer service, timeout reaper
    /// and (if configured) the retention sweep.
    pub async fn start(self) -> Result<Runtime> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let (timer_task, timers) = TimerService::start(fired_tx);
        let (closed, _) = watch::channel(0);

        let engine = Arc::new(Engine {
            store: self.store,
            workflows: self.workflows,
            activities: self.activities,
            options: self.options,
            workflow_queue: WorkflowQueue::default(),
            activity_queues: ActivityQueues::default(),
            in_flight: Mutex::new(HashMap::new()),
            timers,
            locks: Mutex::new(HashMap::new()),
            start_lock: Mutex::new(()),
            closed,
            shutdown: shutdown_rx,
        });

        let mut tasks = vec![
            timer_task,
            tokio::spawn(engine.clone().run_timer_pump(fired_rx)),
        ];
        let recovery = match engine.recover().await {
            Ok(report) => report,
            Err(err) => {
                tasks.iter().for_each(JoinHandle::abort);
                return Err(err);
            }
        };

        for worker in 0..engine.options.workflow_workers {
            tasks.push(tokio::spawn(engine.clone().run_workflow_worker(worker)));
        }
        tasks.extend(engine.spawn_activity_workers());
        tasks.push(tokio::spawn(engine.clone().run_reaper()));
        if let Some(retention) = engine.options.retention {
            tasks.push(tokio::spawn(engine.clone().run_retention(retention)));
        }

        info!(
            workflows = ?engine.workflows.names(),
            activities = ?engine.activities.names(),
            workflow_workers = engine.options.workflow_workers,
            activity_queues = ?engine.options.activity_queues,
            "runtime started"
        );

        Ok(Runtime {
            engine,
            shutdown: shutdown_tx,
            tasks,
            recovery,
        })
    }
}

/// A running workflow engine.
pub struct Runtime {
    engine: Arc<Engine>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    recovery: RecoveryReport,
}

impl Runtime {
    pub fn builder(store: Arc<dyn EventStore>) -> RuntimeBuilder {
        RuntimeBuilder {
            store,
            workflows: WorkflowRegistry::new(),
            activities: ActivityRegistry::new(),
            options: RuntimeOptions::default(),
        }
    }

    /// Client for starting, signalling, querying and awaiting workflows.
    pub fn client(&self) -> WorkflowClient {
        WorkflowClient::new(self.engine.clone())
    }

    /// Worker protocol for activity workers running outside this runtime.
    pub fn activity_tasks(&self) -> ActivityTaskClient {
        ActivityTaskClient::new(self.engine.clone())
    }

    /// What startup recovery found.
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stops polling and aborts in-flight work. Anything not yet recorded
    /// is redone by the next runtime started on the same store.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in &self.tasks {
            task.abort();
        }
        futures_util::future::join_all(self.tasks).await;
        info!("runtime stopped");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
