//! In-process work queues.
//!
//! Queues only hold references to work that is already durable in history,
//! so losing them on a crash is harmless: recovery rebuilds them by folding
//! every open execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use common::ExecutionKey;
use tokio::sync::{Mutex, Notify, watch};

use crate::task::ActivityTask;

/// Executions that need a workflow pass. An execution is queued at most once
/// at a time; queueing it again while a pass runs schedules another pass.
#[derive(Debug, Default)]
pub(crate) struct WorkflowQueue {
    inner: Mutex<WorkflowQueueInner>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct WorkflowQueueInner {
    queue: VecDeque<ExecutionKey>,
    queued: HashSet<ExecutionKey>,
}

impl WorkflowQueue {
    pub async fn push(&self, execution: ExecutionKey) {
        let mut inner = self.inner.lock().await;
        if inner.queued.insert(execution.clone()) {
            inner.queue.push_back(execution);
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub async fn try_pop(&self) -> Option<ExecutionKey> {
        let mut inner = self.inner.lock().await;
        let execution = inner.queue.pop_front()?;
        inner.queued.remove(&execution);
        Some(execution)
    }

    /// Waits for the next execution; `None` once shutdown is signalled.
    pub async fn pop(&self, shutdown: &mut watch::Receiver<bool>) -> Option<ExecutionKey> {
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(execution) = self.try_pop().await {
                return Some(execution);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }
}

/// Activity tasks by task queue name.
#[derive(Debug, Default)]
pub(crate) struct ActivityQueues {
    queues: Mutex<HashMap<String, VecDeque<ActivityTask>>>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ActivityQueues {
    pub async fn push(&self, task: ActivityTask) {
        let queue = task.task_queue.clone();
        self.queues
            .lock()
            .await
            .entry(queue.clone())
            .or_default()
            .push_back(task);
        self.notifier(&queue).await.notify_one();
    }

    pub async fn try_pop(&self, queue: &str) -> Option<ActivityTask> {
        self.queues
            .lock()
            .await
            .get_mut(queue)
            .and_then(VecDeque::pop_front)
    }

    /// Waits for the next task on `queue`; `None` once shutdown is signalled.
    pub async fn pop(
        &self,
        queue: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<ActivityTask> {
        let notify = self.notifier(queue).await;
        loop {
            if *shutdown.borrow() {
                return None;
            }
            if let Some(task) = self.try_pop(queue).await {
                return Some(task);
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    #[cfg(test)]
    pub async fn len(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map_or(0, VecDeque::len)
    }

    async fn notifier(&self, queue: &str) -> Arc<Notify> {
        self.notifiers
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .clone()
    }
}
