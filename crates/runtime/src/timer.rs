//! In-process timer service.
//!
//! Timers are durable in history (`TimerStarted`); this service only keeps
//! the wake-ups of the current process. Recovery re-arms every timer that
//! has not fired from its recorded deadline.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::ExecutionKey;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use workflow::TimerRef;

/// A timer that reached its deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FiredTimer {
    pub execution: ExecutionKey,
    pub timer: TimerRef,
}

#[derive(Debug)]
struct TimerRequest {
    execution: ExecutionKey,
    timer: TimerRef,
    deadline: DateTime<Utc>,
}

/// Arms timers on a running [`TimerService`].
#[derive(Debug, Clone)]
pub(crate) struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerRequest>,
}

impl TimerHandle {
    pub fn arm(&self, execution: ExecutionKey, timer: TimerRef, deadline: DateTime<Utc>) {
        let request = TimerRequest {
            execution,
            timer,
            deadline,
        };
        if self.tx.send(request).is_err() {
            debug!("timer service stopped, dropping timer");
        }
    }
}

/// Min-heap of deadlines fed by a channel; due timers are sent to `fired`.
pub(crate) struct TimerService {
    rx: mpsc::UnboundedReceiver<TimerRequest>,
    fired: mpsc::UnboundedSender<FiredTimer>,
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, FiredTimer>,
    armed: BTreeSet<(ExecutionKey, TimerRef)>,
    next_seq: u64,
}

impl TimerService {
    pub fn start(fired: mpsc::UnboundedSender<FiredTimer>) -> (JoinHandle<()>, TimerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = TimerService {
            rx,
            fired,
            heap: BinaryHeap::new(),
            entries: HashMap::new(),
            armed: BTreeSet::new(),
            next_seq: 0,
        };
        let handle = tokio::spawn(service.run());
        (handle, TimerHandle { tx })
    }

    async fn run(mut self) {
        loop {
            while let Ok(request) = self.rx.try_recv() {
                self.insert(request);
            }
            if !self.fire_due() {
                return;
            }

            match self.heap.peek().map(|Reverse((at, _))| *at) {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        request = self.rx.recv() => match request {
                            Some(request) => self.insert(request),
                            None => return,
                        },
                    }
                }
                None => match self.rx.recv().await {
                    Some(request) => self.insert(request),
                    None => return,
                },
            }
        }
    }

    fn insert(&mut self, request: TimerRequest) {
        let key = (request.execution.clone(), request.timer.clone());
        if !self.armed.insert(key) {
            return;
        }

        let wait = (request.deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((Instant::now() + wait, seq)));
        self.entries.insert(
            seq,
            FiredTimer {
                execution: request.execution,
                timer: request.timer,
            },
        );
    }

    /// Sends every due timer. Returns false once nobody listens.
    fn fire_due(&mut self) -> bool {
        let now = Instant::now();
        while let Some(Reverse((at, seq))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            if let Some(timer) = self.entries.remove(&seq) {
                self.armed
                    .remove(&(timer.execution.clone(), timer.timer.clone()));
                if self.fired.send(timer).is_err() {
                    return false;
                }
            }
        }
        true
    }
}
