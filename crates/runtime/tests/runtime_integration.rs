//! End-to-end tests for the runtime against the in-memory store.
//!
//! Restarts are simulated by shutting a runtime down and starting a new one
//! on a clone of the same store, which shares its history.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Poll, ready};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    ActivityError, ExecutionKey, GENERIC_ERROR, HEARTBEAT_TIMEOUT, RetryPolicy,
    UNREGISTERED_ACTIVITY,
};
use event_store::{
    AppendOptions, EventEnvelope, EventQuery, EventStore, EventStoreError, InMemoryEventStore,
    SequenceNo,
};
use runtime::{
    Activity, ActivityContext, ActivityTask, ActivityTaskClient, CHILD_CANCELLED,
    CHILD_TERMINATED, Runtime, RuntimeError, RuntimeOptions, StartWorkflowOptions, WorkflowClient,
};
use serde_json::{Value, json};
use tokio::sync::Notify;
use workflow::{
    ActivityOptions, ChildWorkflowOptions, CompensationSpec, ExecutionStatus, FnWorkflow,
    HistoryEvent, ParentClosePolicy, WORKFLOW_EXECUTION_TIMEOUT, WorkflowError, WorkflowEvent,
    WorkflowFailure,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_options() -> RuntimeOptions {
    RuntimeOptions::new().dispatcher_sweep_interval(Duration::from_millis(10))
}

fn quick_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy::new(attempts)
        .with_initial_interval(Duration::from_millis(10))
        .with_maximum_interval(Duration::from_millis(40))
}

fn step(attempts: u32) -> ActivityOptions {
    ActivityOptions::new().retry_policy(quick_retry(attempts))
}

fn undo(activity: &str) -> CompensationSpec {
    CompensationSpec::new(activity).retry_policy(quick_retry(3))
}

type Log = Arc<Mutex<Vec<String>>>;

/// Appends its name to a shared log, then succeeds or fails as configured.
struct Recording {
    name: String,
    log: Log,
    error: Option<ActivityError>,
}

impl Recording {
    fn ok(log: &Log, name: &str) -> Self {
        Self {
            name: name.to_string(),
            log: log.clone(),
            error: None,
        }
    }

    fn failing(log: &Log, name: &str, error: ActivityError) -> Self {
        Self {
            error: Some(error),
            ..Self::ok(log, name)
        }
    }
}

#[async_trait]
impl Activity for Recording {
    async fn execute(&self, _ctx: ActivityContext, input: Value) -> Result<Value, ActivityError> {
        self.log.lock().unwrap().push(self.name.clone());
        match &self.error {
            Some(error) => Err(error.clone()),
            None => Ok(json!({"done": self.name, "input": input})),
        }
    }
}

/// Signals that it started, then never finishes.
struct Hanging {
    started: Arc<Notify>,
}

#[async_trait]
impl Activity for Hanging {
    async fn execute(&self, _ctx: ActivityContext, _input: Value) -> Result<Value, ActivityError> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

async fn history(client: &WorkflowClient, execution: &ExecutionKey) -> Vec<HistoryEvent> {
    client.history(execution).await.unwrap()
}

fn count_events(history: &[HistoryEvent], event_type: &str) -> usize {
    history
        .iter()
        .filter(|event| event.event.event_type() == event_type)
        .count()
}

fn scheduled(history: &[HistoryEvent], activity_type: &str) -> usize {
    history
        .iter()
        .filter(|event| {
            matches!(&event.event, WorkflowEvent::ActivityScheduled(activity) if activity.activity_type == activity_type)
        })
        .count()
}

/// Polls history until `event_type` shows up.
async fn wait_for_event(client: &WorkflowClient, execution: &ExecutionKey, event_type: &str) -> Vec<HistoryEvent> {
    tokio::time::timeout(WAIT, async {
        loop {
            let history = history(client, execution).await;
            if count_events(&history, event_type) > 0 {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{event_type} never recorded for {execution}"))
}

#[tokio::test]
async fn test_transient_failures_are_retried_with_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Charge", |ctx| {
            let receipt = ready!(ctx.activity("ChargeCard", json!({"amount": 10}), step(5)))?;
            Poll::Ready(Ok(receipt))
        }))
        .activity_fn("ChargeCard", move |ctx: ActivityContext, _input: Value| {
            let calls = counter.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt() < 3 {
                    return Err(ActivityError::transient("gateway unavailable"));
                }
                Ok(json!({"attempt": ctx.attempt()}))
            }
        })
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Charge", json!({}), StartWorkflowOptions::new("charge-1"))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.result, Ok(json!({"attempt": 3})));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let delays: Vec<Duration> = history(&client, &execution)
        .await
        .into_iter()
        .filter_map(|event| match event.event {
            WorkflowEvent::ActivityAttemptFailed { retry_delay, .. } => Some(retry_delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays, vec![Duration::from_millis(10), Duration::from_millis(20)]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_workflow() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Charge", |ctx| {
            let receipt = ready!(ctx.activity("ChargeCard", json!({}), step(3)))?;
            Poll::Ready(Ok(receipt))
        }))
        .activity_fn("ChargeCard", |_ctx: ActivityContext, _input: Value| async {
            Err::<Value, _>(ActivityError::transient("gateway unavailable"))
        })
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Charge", json!({}), StartWorkflowOptions::new("charge-2"))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, GENERIC_ERROR);
    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.step.as_deref(), Some("ChargeCard"));
    assert!(failure.compensation.is_none());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_failure_compensates_completed_steps_in_reverse() {
    let log: Log = Arc::default();
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("FourSteps", |ctx| {
            for (forward, compensation) in [("A", "UndoA"), ("B", "UndoB"), ("C", "UndoC")] {
                ready!(ctx.activity_with_compensation(
                    forward,
                    json!({"step": forward}),
                    step(1),
                    undo(compensation),
                ))?;
            }
            let d = ready!(ctx.activity("D", json!({}), step(1)))?;
            Poll::Ready(Ok(d))
        }))
        .activity("A", Recording::ok(&log, "A"))
        .activity("B", Recording::ok(&log, "B"))
        .activity("C", Recording::ok(&log, "C"))
        .activity(
            "D",
            Recording::failing(&log, "D", ActivityError::permanent("OUT_OF_STOCK", "nothing left")),
        )
        .activity("UndoA", Recording::ok(&log, "UndoA"))
        .activity("UndoB", Recording::ok(&log, "UndoB"))
        .activity("UndoC", Recording::ok(&log, "UndoC"))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("FourSteps", json!({}), StartWorkflowOptions::new("saga-1"))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["A", "B", "C", "D", "UndoC", "UndoB", "UndoA"]
    );
    assert_eq!(outcome.status, ExecutionStatus::Failed);
    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, "OUT_OF_STOCK");
    let report = failure.compensation.expect("compensation report");
    let undone: Vec<&str> = report.compensated.iter().map(|o| o.step.as_str()).collect();
    assert_eq!(undone, vec!["C", "B", "A"]);
    assert!(report.is_complete());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_activity_fails_without_retry() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Lost", |ctx| {
            let value = ready!(ctx.activity("Missing", json!({}), step(5)))?;
            Poll::Ready(Ok(value))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Lost", json!({}), StartWorkflowOptions::new("lost-1"))
        .await
        .unwrap();
    let failure = client
        .get_result(&execution, WAIT)
        .await
        .unwrap()
        .into_result()
        .unwrap_err();

    assert_eq!(failure.kind, UNREGISTERED_ACTIVITY);
    assert_eq!(failure.attempts, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_restart_resumes_interrupted_activity() {
    let store = InMemoryEventStore::new();
    let workflow = || {
        FnWorkflow::new("Shipping", |ctx| {
            let label = ready!(ctx.activity("Ship", json!({"parcel": 7}), step(3)))?;
            Poll::Ready(Ok(label))
        })
    };

    let started = Arc::new(Notify::new());
    let first = Runtime::builder(Arc::new(store.clone()))
        .options(fast_options())
        .workflow(workflow())
        .activity("Ship", Hanging {
            started: started.clone(),
        })
        .start()
        .await
        .unwrap();
    let execution = first
        .client()
        .start_workflow("Shipping", json!({}), StartWorkflowOptions::new("ship-1"))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    first.shutdown().await;

    let log: Log = Arc::default();
    let second = Runtime::builder(Arc::new(store))
        .options(fast_options())
        .workflow(workflow())
        .activity("Ship", Recording::ok(&log, "Ship"))
        .start()
        .await
        .unwrap();
    assert_eq!(second.recovery().resumed, 1);

    let client = second.client();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(*log.lock().unwrap(), vec!["Ship"]);
    assert_eq!(scheduled(&history(&client, &execution).await, "Ship"), 1);

    second.shutdown().await;
}

#[tokio::test]
async fn test_restart_during_unwind_runs_each_compensation_once() {
    let store = InMemoryEventStore::new();
    let workflow = || {
        FnWorkflow::new("TwoSteps", |ctx| {
            ready!(ctx.activity_with_compensation("A", json!({}), step(1), undo("UndoA")))?;
            ready!(ctx.activity_with_compensation("B", json!({}), step(1), undo("UndoB")))?;
            let c = ready!(ctx.activity("C", json!({}), step(1)))?;
            Poll::Ready(Ok(c))
        })
    };
    let log: Log = Arc::default();
    let builder = |store: &InMemoryEventStore| {
        Runtime::builder(Arc::new(store.clone()))
            .options(fast_options())
            .workflow(workflow())
            .activity("A", Recording::ok(&log, "A"))
            .activity("B", Recording::ok(&log, "B"))
            .activity(
                "C",
                Recording::failing(&log, "C", ActivityError::permanent("DECLINED", "no")),
            )
            .activity("UndoB", Recording::ok(&log, "UndoB"))
    };

    // UndoB completes, then the process dies while UndoA runs
    let started = Arc::new(Notify::new());
    let first = builder(&store)
        .activity("UndoA", Hanging {
            started: started.clone(),
        })
        .start()
        .await
        .unwrap();
    let execution = first
        .client()
        .start_workflow("TwoSteps", json!({}), StartWorkflowOptions::new("unwind-1"))
        .await
        .unwrap();
    tokio::time::timeout(WAIT, started.notified()).await.unwrap();
    first.shutdown().await;

    let second = builder(&store)
        .activity("UndoA", Recording::ok(&log, "UndoA"))
        .start()
        .await
        .unwrap();
    let client = second.client();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["A", "B", "C", "UndoB", "UndoA"]);
    let history = history(&client, &execution).await;
    assert_eq!(scheduled(&history, "UndoA"), 1);
    assert_eq!(scheduled(&history, "UndoB"), 1);
    assert_eq!(count_events(&history, "CompensationStarted"), 1);

    let report = outcome.result.unwrap_err().compensation.expect("report");
    assert_eq!(report.compensated.len(), 2);

    second.shutdown().await;
}

#[tokio::test]
async fn test_child_workflow_result_reaches_parent() {
    let log: Log = Arc::default();
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Parent", |ctx| {
            let order = ctx.input().clone();
            let payment = ready!(ctx.child_workflow(
                "Payment",
                "payment-of-order-1",
                order,
                ChildWorkflowOptions::new(),
            ))?;
            Poll::Ready(Ok(json!({"payment": payment})))
        }))
        .workflow(FnWorkflow::new("Payment", |ctx| {
            let charged = ready!(ctx.activity("Charge", ctx.input().clone(), step(1)))?;
            Poll::Ready(Ok(charged))
        }))
        .activity("Charge", Recording::ok(&log, "Charge"))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Parent", json!({"total": 42}), StartWorkflowOptions::new("order-1"))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(
        outcome.result,
        Ok(json!({"payment": {"done": "Charge", "input": {"total": 42}}}))
    );
    let history = history(&client, &execution).await;
    assert_eq!(count_events(&history, "ChildWorkflowStarted"), 1);
    assert_eq!(count_events(&history, "ChildWorkflowCompleted"), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_child_failure_fails_parent() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Parent", |ctx| {
            let payment = ready!(ctx.child_workflow(
                "Payment",
                "payment-of-order-2",
                json!({}),
                ChildWorkflowOptions::new(),
            ))?;
            Poll::Ready(Ok(payment))
        }))
        .workflow(FnWorkflow::new("Payment", |_ctx| {
            Poll::Ready(Err(WorkflowFailure::new("INSUFFICIENT_FUNDS", "balance too low")))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Parent", json!({}), StartWorkflowOptions::new("order-2"))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Failed);
    assert_eq!(outcome.result.unwrap_err().kind, "INSUFFICIENT_FUNDS");

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_terminating_parent_terminates_child() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Parent", |ctx| {
            let result = ready!(ctx.child_workflow(
                "Waiter",
                "waiter-1",
                json!({}),
                ChildWorkflowOptions::new().parent_close_policy(ParentClosePolicy::Terminate),
            ))?;
            Poll::Ready(Ok(result))
        }))
        .workflow(FnWorkflow::new("Waiter", |ctx| {
            let value = ready!(ctx.wait_for_signal("never"));
            Poll::Ready(Ok(value))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let parent = client
        .start_workflow("Parent", json!({}), StartWorkflowOptions::new("parent-1"))
        .await
        .unwrap();
    let history = wait_for_event(&client, &parent, "ChildWorkflowStarted").await;
    let child = history
        .iter()
        .find_map(|event| match &event.event {
            WorkflowEvent::ChildWorkflowStarted {
                workflow_id, run_id, ..
            } => Some(ExecutionKey::new(workflow_id.as_str(), *run_id)),
            _ => None,
        })
        .unwrap();

    client.terminate(&parent, "operator request").await.unwrap();

    let parent_outcome = client.get_result(&parent, WAIT).await.unwrap();
    assert_eq!(parent_outcome.status, ExecutionStatus::Cancelled);
    assert_eq!(parent_outcome.result.unwrap_err().kind, CHILD_TERMINATED);

    let child_outcome = client.get_result(&child, WAIT).await.unwrap();
    assert_eq!(child_outcome.status, ExecutionStatus::Cancelled);
    assert_eq!(child_outcome.result.unwrap_err().kind, CHILD_TERMINATED);

    assert!(matches!(
        client.terminate(&parent, "again").await,
        Err(RuntimeError::ExecutionClosed(_))
    ));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_signal_query_and_duplicate_start() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Approval", |ctx| {
            ctx.expose("stage", json!("waiting"));
            let approval = ready!(ctx.wait_for_signal("approve"));
            Poll::Ready(Ok(approval))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();
    let options = || StartWorkflowOptions::new("approval-1");

    let execution = client
        .start_workflow("Approval", json!({}), options())
        .await
        .unwrap();
    assert!(matches!(
        client.start_workflow("Approval", json!({}), options()).await,
        Err(RuntimeError::AlreadyRunning { run_id, .. }) if run_id == execution.run_id
    ));

    assert_eq!(client.query(&execution, "stage").await.unwrap(), json!("waiting"));
    assert!(matches!(
        client.query(&execution, "nope").await,
        Err(RuntimeError::UnknownQuery { .. })
    ));
    assert_eq!(client.status(&execution).await.unwrap(), ExecutionStatus::Running);

    client
        .signal(&execution, "approve", json!({"by": "ops"}))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.result, Ok(json!({"by": "ops"})));

    assert!(matches!(
        client.signal(&execution, "approve", json!({})).await,
        Err(RuntimeError::ExecutionClosed(_))
    ));

    // The id is free again once its run closed
    let next = client
        .start_workflow("Approval", json!({}), options())
        .await
        .unwrap();
    assert_ne!(next.run_id, execution.run_id);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_unknown_workflow_type_is_rejected() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .start()
        .await
        .unwrap();

    let result = runtime
        .client()
        .start_workflow("Nope", json!({}), StartWorkflowOptions::new("nope-1"))
        .await;
    assert!(matches!(
        result,
        Err(RuntimeError::Workflow(WorkflowError::UnknownWorkflowType(_)))
    ));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_cancel_unwinds_compensation_stack() {
    let log: Log = Arc::default();
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Reservation", |ctx| {
            ready!(ctx.activity_with_compensation("Reserve", json!({"sku": "X"}), step(1), undo("Release")))?;
            let go = ready!(ctx.wait_for_signal("go"));
            Poll::Ready(Ok(go))
        }))
        .activity("Reserve", Recording::ok(&log, "Reserve"))
        .activity("Release", Recording::ok(&log, "Release"))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Reservation", json!({}), StartWorkflowOptions::new("reserve-1"))
        .await
        .unwrap();
    wait_for_event(&client, &execution, "ActivityCompleted").await;

    client.cancel(&execution, "customer request").await.unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Cancelled);
    let failure = outcome.result.unwrap_err();
    assert_eq!(failure.kind, CHILD_CANCELLED);
    assert_eq!(failure.message, "customer request");
    assert_eq!(failure.compensation.expect("report").compensated.len(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["Reserve", "Release"]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_execution_timeout_closes_run() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Sleepy", |ctx| {
            ready!(ctx.timer(Duration::from_secs(3600)));
            Poll::Ready(Ok(Value::Null))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow(
            "Sleepy",
            json!({}),
            StartWorkflowOptions::new("sleepy-1").execution_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::TimedOut);
    assert_eq!(outcome.result.unwrap_err().kind, WORKFLOW_EXECUTION_TIMEOUT);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_workflow_retry_starts_a_new_run() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("ColdStart", |ctx| {
            if ctx.attempt() == 1 {
                return Poll::Ready(Err(WorkflowFailure::new("BOOT", "cold start")));
            }
            Poll::Ready(Ok(json!({"attempt": ctx.attempt()})))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let first = client
        .start_workflow(
            "ColdStart",
            json!({}),
            StartWorkflowOptions::new("cold-1").retry_policy(quick_retry(3)),
        )
        .await
        .unwrap();
    let outcome = client.get_result(&first, WAIT).await.unwrap();

    assert_eq!(outcome.status, ExecutionStatus::Completed);
    assert_eq!(outcome.attempt, 2);
    assert_eq!(outcome.result, Ok(json!({"attempt": 2})));
    assert_eq!(outcome.execution.workflow_id, first.workflow_id);
    assert_ne!(outcome.execution.run_id, first.run_id);
    assert_eq!(client.status(&first).await.unwrap(), ExecutionStatus::Failed);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_missing_heartbeat_fails_attempt() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options())
        .workflow(FnWorkflow::new("Scanner", |ctx| {
            let options = step(2).heartbeat_timeout(Duration::from_millis(50));
            let scanned = ready!(ctx.activity("Scan", json!({}), options))?;
            Poll::Ready(Ok(scanned))
        }))
        .activity_fn("Scan", |ctx: ActivityContext, _input: Value| async move {
            if ctx.attempt() == 1 {
                // Stuck without heartbeating
                tokio::time::sleep(Duration::from_secs(2)).await;
                return Ok(json!("late"));
            }
            assert!(ctx.heartbeat().await);
            Ok::<_, ActivityError>(json!("scanned"))
        })
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Scanner", json!({}), StartWorkflowOptions::new("scan-1"))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.result, Ok(json!("scanned")));

    let kinds: Vec<String> = history(&client, &execution)
        .await
        .into_iter()
        .filter_map(|event| match event.event {
            WorkflowEvent::ActivityAttemptFailed { error, .. } => Some(error.kind),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, vec![HEARTBEAT_TIMEOUT.to_string()]);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_limit_holds_back_tasks() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (gauge, high_water) = (running.clone(), peak.clone());
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options().max_concurrent_activities(2))
        .workflow(FnWorkflow::new("FanOut", |ctx| {
            let pending: Vec<_> = (0..6)
                .map(|i| ctx.activity("Work", json!(i), step(1)))
                .collect();
            let mut results = Vec::new();
            for poll in pending {
                results.push(ready!(poll)?);
            }
            Poll::Ready(Ok(Value::Array(results)))
        }))
        .activity_fn("Work", move |_ctx: ActivityContext, input: Value| {
            let (running, peak) = (gauge.clone(), high_water.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, ActivityError>(input)
            }
        })
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("FanOut", json!({}), StartWorkflowOptions::new("fan-1"))
        .await
        .unwrap();
    let outcome = client.get_result(&execution, WAIT).await.unwrap();

    assert_eq!(outcome.result, Ok(json!([0, 1, 2, 3, 4, 5])));
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak concurrency was {peak}");

    runtime.shutdown().await;
}

async fn next_task(tasks: &ActivityTaskClient, queue: &str) -> ActivityTask {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(task) = tasks.poll(queue).await {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no task was queued")
}

#[tokio::test]
async fn test_external_worker_protocol() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(fast_options().activity_queues(Vec::<String>::new()))
        .workflow(FnWorkflow::new("Labeling", |ctx| {
            let options = step(2).task_queue("external");
            let label = ready!(ctx.activity("PrintLabel", json!({"parcel": 1}), options))?;
            Poll::Ready(Ok(label))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();
    let tasks = runtime.activity_tasks();

    let execution = client
        .start_workflow("Labeling", json!({}), StartWorkflowOptions::new("label-1"))
        .await
        .unwrap();
    let first = next_task(&tasks, "external").await;
    assert_eq!(first.activity_type, "PrintLabel");
    assert_eq!(first.attempt(), 1);
    assert_eq!(first.execution(), &execution);
    assert!(tasks.heartbeat(&first.task_id).await);
    assert!(
        tasks
            .fail(&first.task_id, ActivityError::transient("printer jammed"), false)
            .await
            .unwrap()
    );

    let second = next_task(&tasks, "external").await;
    assert_eq!(second.attempt(), 2);
    assert!(tasks.complete(&second.task_id, json!("LBL-1")).await.unwrap());

    // Outcomes for attempts that are no longer current are dropped
    assert!(!tasks.complete(&first.task_id, json!("stale")).await.unwrap());
    assert!(!tasks.heartbeat(&first.task_id).await);

    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.result, Ok(json!("LBL-1")));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_retention_purges_closed_executions_only() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .options(
            fast_options()
                .retention(Duration::from_millis(1))
                .retention_sweep_interval(Duration::from_millis(20)),
        )
        .workflow(FnWorkflow::new("Instant", |ctx| Poll::Ready(Ok(ctx.input().clone()))))
        .workflow(FnWorkflow::new("Waiter", |ctx| {
            let value = ready!(ctx.wait_for_signal("never"));
            Poll::Ready(Ok(value))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let open = client
        .start_workflow("Waiter", json!({}), StartWorkflowOptions::new("waiter-1"))
        .await
        .unwrap();
    let closed = client
        .start_workflow("Instant", json!(1), StartWorkflowOptions::new("instant-1"))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while !matches!(client.status(&closed).await, Err(RuntimeError::NotFound(_))) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("closed execution was never purged");

    assert_eq!(client.status(&open).await.unwrap(), ExecutionStatus::Running);

    runtime.shutdown().await;
}

/// Delegates to an in-memory store but loses the next `conflicts` races,
/// optionally only those of batches starting with one event type.
#[derive(Default)]
struct ContendedStore {
    inner: InMemoryEventStore,
    conflicts: AtomicU32,
    only: Mutex<Option<String>>,
}

impl ContendedStore {
    fn lose_next(&self, conflicts: u32) {
        *self.only.lock().unwrap() = None;
        self.conflicts.store(conflicts, Ordering::SeqCst);
    }

    fn lose_next_of(&self, event_type: &str, conflicts: u32) {
        *self.only.lock().unwrap() = Some(event_type.to_string());
        self.conflicts.store(conflicts, Ordering::SeqCst);
    }

    fn targets(&self, events: &[EventEnvelope]) -> bool {
        match self.only.lock().unwrap().as_deref() {
            Some(event_type) => events.first().is_some_and(|event| event.event_type == event_type),
            None => true,
        }
    }
}

#[async_trait]
impl EventStore for ContendedStore {
    async fn append(
        &self,
        events: Vec<EventEnvelope>,
        options: AppendOptions,
    ) -> event_store::Result<SequenceNo> {
        let lose = self.targets(&events)
            && self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if lose && let Some(expected) = options.expected_sequence {
            return Err(EventStoreError::ConcurrentAppendConflict {
                execution: events[0].execution.clone(),
                expected,
                actual: expected.next(),
            });
        }
        self.inner.append(events, options).await
    }

    async fn read_history(&self, execution: &ExecutionKey) -> event_store::Result<Vec<EventEnvelope>> {
        self.inner.read_history(execution).await
    }

    async fn read_history_from(
        &self,
        execution: &ExecutionKey,
        from_sequence: SequenceNo,
    ) -> event_store::Result<Vec<EventEnvelope>> {
        self.inner.read_history_from(execution, from_sequence).await
    }

    async fn query_events(&self, query: EventQuery) -> event_store::Result<Vec<EventEnvelope>> {
        self.inner.query_events(query).await
    }

    async fn last_sequence(&self, execution: &ExecutionKey) -> event_store::Result<Option<SequenceNo>> {
        self.inner.last_sequence(execution).await
    }

    async fn list_executions(&self) -> event_store::Result<Vec<ExecutionKey>> {
        self.inner.list_executions().await
    }

    async fn purge_execution(&self, execution: &ExecutionKey) -> event_store::Result<u64> {
        self.inner.purge_execution(execution).await
    }
}

#[tokio::test]
async fn test_append_conflicts_are_retried_then_surfaced() {
    let store = Arc::new(ContendedStore::default());
    let runtime = Runtime::builder(store.clone())
        .options(fast_options().max_append_retries(2))
        .workflow(FnWorkflow::new("Approval", |ctx| {
            let approval = ready!(ctx.wait_for_signal("approve"));
            Poll::Ready(Ok(approval))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Approval", json!({}), StartWorkflowOptions::new("contended-1"))
        .await
        .unwrap();

    store.lose_next(100);
    assert!(matches!(
        client.signal(&execution, "approve", json!(1)).await,
        Err(RuntimeError::AppendContention { attempts: 3, .. })
    ));

    // Two lost races are absorbed by re-reading history
    store.lose_next(2);
    client.signal(&execution, "approve", json!(2)).await.unwrap();

    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.result, Ok(json!(2)));
    let signals = count_events(&history(&client, &execution).await, "SignalReceived");
    assert_eq!(signals, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_contended_activity_outcome_can_be_reported_again() {
    let store = Arc::new(ContendedStore::default());
    let runtime = Runtime::builder(store.clone())
        .options(
            fast_options()
                .max_append_retries(1)
                .activity_queues(Vec::<String>::new()),
        )
        .workflow(FnWorkflow::new("Labeling", |ctx| {
            let options = step(1).task_queue("external");
            let label = ready!(ctx.activity("PrintLabel", json!({"parcel": 2}), options))?;
            Poll::Ready(Ok(label))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();
    let tasks = runtime.activity_tasks();

    let execution = client
        .start_workflow("Labeling", json!({}), StartWorkflowOptions::new("label-contended"))
        .await
        .unwrap();
    let task = next_task(&tasks, "external").await;

    store.lose_next_of("ActivityCompleted", 2);
    assert!(matches!(
        tasks.complete(&task.task_id, json!("LBL-2")).await,
        Err(RuntimeError::AppendContention { attempts: 2, .. })
    ));

    // The attempt is still owed, so the worker can report it again
    assert!(tasks.heartbeat(&task.task_id).await);
    assert!(tasks.complete(&task.task_id, json!("LBL-2")).await.unwrap());

    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.result, Ok(json!("LBL-2")));
    assert_eq!(count_events(&history(&client, &execution).await, "ActivityCompleted"), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_contended_workflow_pass_is_requeued() {
    let store = Arc::new(ContendedStore::default());
    let runtime = Runtime::builder(store.clone())
        .options(fast_options().max_append_retries(1))
        .workflow(FnWorkflow::new("Approval", |ctx| {
            let approval = ready!(ctx.wait_for_signal("approve"));
            Poll::Ready(Ok(approval))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Approval", json!({}), StartWorkflowOptions::new("requeued-1"))
        .await
        .unwrap();

    // The signal lands, but the pass that completes the run loses every race
    store.lose_next_of("WorkflowCompleted", 2);
    client.signal(&execution, "approve", json!("yes")).await.unwrap();

    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.result, Ok(json!("yes")));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_contended_timer_is_rearmed() {
    let store = Arc::new(ContendedStore::default());
    let runtime = Runtime::builder(store.clone())
        .options(fast_options().max_append_retries(1))
        .workflow(FnWorkflow::new("Sleeper", |ctx| {
            ready!(ctx.timer(Duration::from_millis(20)));
            Poll::Ready(Ok(json!("woke")))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    store.lose_next_of("TimerFired", 2);
    let execution = client
        .start_workflow("Sleeper", json!({}), StartWorkflowOptions::new("sleeper-1"))
        .await
        .unwrap();

    let outcome = client.get_result(&execution, WAIT).await.unwrap();
    assert_eq!(outcome.result, Ok(json!("woke")));
    assert_eq!(count_events(&history(&client, &execution).await, "TimerFired"), 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_get_result_times_out_for_open_run() {
    let runtime = Runtime::builder(Arc::new(InMemoryEventStore::new()))
        .workflow(FnWorkflow::new("Waiter", |ctx| {
            let value = ready!(ctx.wait_for_signal("never"));
            Poll::Ready(Ok(value))
        }))
        .start()
        .await
        .unwrap();
    let client = runtime.client();

    let execution = client
        .start_workflow("Waiter", json!({}), StartWorkflowOptions::new("waiter-2"))
        .await
        .unwrap();
    assert!(matches!(
        client.get_result(&execution, Duration::from_millis(50)).await,
        Err(RuntimeError::Timeout(_))
    ));

    runtime.shutdown().await;
}
