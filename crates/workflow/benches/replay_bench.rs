use std::task::{Poll, ready};

use chrono::Utc;
use common::{ExecutionKey, RetryPolicy, RunId};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use event_store::SequenceNo;
use serde_json::json;
use workflow::{
    ActivityOptions, CompensationSpec, ExecutionState, FnWorkflow, HistoryEvent,
    ScheduledActivity, WorkflowDefinition, WorkflowEvent, replay,
};

const STEPS: u64 = 50;

fn steps_workflow() -> impl WorkflowDefinition {
    FnWorkflow::new("Steps", |ctx| {
        for step in 0..STEPS {
            ready!(ctx.activity_with_compensation(
                "Step",
                json!({"step": step}),
                ActivityOptions::default(),
                CompensationSpec::new("UndoStep"),
            ))?;
        }
        Poll::Ready(Ok(json!({"steps": STEPS})))
    })
}

/// History of a run whose first `completed` steps finished.
fn history(completed: u64) -> Vec<HistoryEvent> {
    let mut events = vec![WorkflowEvent::WorkflowStarted {
        workflow_type: "Steps".into(),
        input: json!({}),
        attempt: 1,
        retry_policy: RetryPolicy::no_retry(),
        execution_timeout: None,
        start_delay: None,
        parent: None,
        previous_run: None,
    }];
    for activity_id in 1..=completed {
        let input = json!({"step": activity_id - 1});
        events.push(WorkflowEvent::ActivityScheduled(ScheduledActivity {
            activity_id,
            activity_type: "Step".into(),
            input: input.clone(),
            options: ActivityOptions::default(),
            compensation: Some(saga::CompensationRef::new("Step", input, "UndoStep")),
            compensates: None,
        }));
        events.push(WorkflowEvent::ActivityCompleted {
            activity_id,
            result: json!({"ok": activity_id}),
            attempt: 1,
        });
    }

    events
        .into_iter()
        .enumerate()
        .map(|(i, event)| HistoryEvent::new(SequenceNo::new(i as i64 + 1), Utc::now(), event))
        .collect()
}

fn bench_fold(c: &mut Criterion) {
    let execution = ExecutionKey::new("bench", RunId::new());
    let mut group = c.benchmark_group("workflow/fold");

    for completed in [10, STEPS] {
        let events = history(completed);
        group.bench_with_input(BenchmarkId::from_parameter(completed), &events, |b, events| {
            b.iter(|| ExecutionState::fold(&execution, events).unwrap());
        });
    }

    group.finish();
}

fn bench_replay(c: &mut Criterion) {
    let execution = ExecutionKey::new("bench", RunId::new());
    let definition = steps_workflow();
    let mut group = c.benchmark_group("workflow/replay");

    for completed in [10, STEPS] {
        let state = ExecutionState::fold(&execution, &history(completed)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(completed), &state, |b, state| {
            b.iter(|| replay(&definition, state).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fold, bench_replay);
criterion_main!(benches);
