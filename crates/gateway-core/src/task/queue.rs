//! Priority task queue and strictly-serial executor.
//!
//! Pending tasks are held in a min-heap keyed by `(priority, created_at)` so
//! lower priority numbers run first and ties break FIFO. At most one task
//! runs at a time; `schedule()` is idempotent and re-invoked after `add`,
//! `start`, and every settlement.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TaskError;
use crate::task::{Task, TaskStatus};

/// Wraps a task id with the ordering key used by the heap. `BinaryHeap` is a
/// max-heap, so `Ord` is implemented in reverse: lower priority numbers and
/// earlier `created_at` compare greater, surfacing them at the top.
#[derive(Debug, Clone, Eq, PartialEq)]
struct QueuedTask {
    id: Uuid,
    priority: u8,
    created_at: chrono::DateTime<Utc>,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Async attempt-lifecycle hook, invoked with the task as it starts or
/// settles an attempt. Boxed rather than generic so the queue can hold a
/// heterogeneous pair without extra type parameters. `schedule` awaits the
/// returned future directly, so a hook that appends to the message buffer
/// is guaranteed to have landed before the executor moves on.
pub type AttemptHook = Arc<dyn Fn(Task) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// The executor's output for one attempt: either a result string or a
/// [`TaskError`] classifying the failure.
pub type AttemptResult = Result<String, TaskError>;

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    registry: HashMap<Uuid, Task>,
    current: Option<Uuid>,
    running: bool,
}

/// A priority-ordered, strictly serial task queue.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    on_attempt_start: AttemptHook,
    on_attempt_settled: AttemptHook,
}

impl TaskQueue {
    pub fn new(on_attempt_start: AttemptHook, on_attempt_settled: AttemptHook) -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                registry: HashMap::new(),
                current: None,
                running: false,
            }),
            on_attempt_start,
            on_attempt_settled,
        }
    }

    /// Add a task to the queue. Does not itself run it; callers invoke
    /// [`Self::schedule`] (typically via [`crate::gateway`]) to attempt a
    /// dispatch.
    pub async fn add(&self, task: Task) {
        let mut state = self.state.lock().await;
        let queued = QueuedTask {
            id: task.id,
            priority: task.priority,
            created_at: task.created_at,
        };
        state.registry.insert(task.id, task);
        state.heap.push(queued);
    }

    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        state.running = true;
    }

    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.running = false;
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.heap.len()
    }

    pub async fn current_task(&self) -> Option<Task> {
        let state = self.state.lock().await;
        state.current.and_then(|id| state.registry.get(&id).cloned())
    }

    pub async fn get_task(&self, id: Uuid) -> Option<Task> {
        self.state.lock().await.registry.get(&id).cloned()
    }

    /// Atomically remove every pending task from the heap and transition
    /// each to `cancelled`. The currently running task, if any, is left
    /// untouched. Returns the drained tasks.
    pub async fn drain_pending(&self, cancel_reason: &str, status_note: &str) -> Vec<Task> {
        let mut state = self.state.lock().await;
        let mut drained = Vec::with_capacity(state.heap.len());
        while let Some(queued) = state.heap.pop() {
            if let Some(task) = state.registry.get_mut(&queued.id) {
                task.status = TaskStatus::Cancelled;
                task.finished_at = Some(Utc::now());
                task.metadata.insert(
                    "cancel_reason".to_string(),
                    serde_json::Value::String(cancel_reason.to_string()),
                );
                drained.push(task.clone());
            }
        }
        let _ = status_note;
        drained
    }

    /// Pop the next task to run, if the queue is running, idle, and
    /// non-empty. Transitions it to `running` and stamps `started_at`.
    async fn try_claim_next(&self) -> Option<Task> {
        let mut state = self.state.lock().await;
        if !state.running || state.current.is_some() {
            return None;
        }
        let queued = state.heap.pop()?;
        let task = state.registry.get_mut(&queued.id)?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        state.current = Some(queued.id);
        state.registry.get(&queued.id).cloned()
    }

    async fn requeue(&self, id: Uuid) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.registry.get(&id) {
            state.heap.push(QueuedTask {
                id,
                priority: task.priority,
                created_at: task.created_at,
            });
        }
        state.current = None;
    }

    async fn clear_current(&self) {
        self.state.lock().await.current = None;
    }

    async fn mutate_task<F: FnOnce(&mut Task)>(&self, id: Uuid, f: F) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.registry.get_mut(&id) {
            f(task);
        }
    }

    /// Idempotent dispatch: claim the next eligible task, run it through
    /// `executor`, and settle it. A no-op if the queue is stopped, a task is
    /// already running, or the heap is empty. Recurses (via the caller's
    /// retry loop) until no further task can be claimed.
    pub async fn schedule<F, Fut>(self: &Arc<Self>, executor: F)
    where
        F: Fn(Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = AttemptResult> + Send,
    {
        loop {
            let Some(task) = self.try_claim_next().await else {
                return;
            };

            (self.on_attempt_start)(task.clone()).await;
            let result = executor(task.clone()).await;
            self.settle(task.id, result).await;
            let settled = self
                .get_task(task.id)
                .await
                .expect("task remains in registry after settlement");
            (self.on_attempt_settled)(settled).await;
        }
    }

    async fn settle(&self, id: Uuid, result: AttemptResult) {
        match result {
            Ok(output) => {
                self.mutate_task(id, |task| {
                    task.status = TaskStatus::Success;
                    task.result = Some(output);
                    task.finished_at = Some(Utc::now());
                })
                .await;
                self.clear_current().await;
            }
            Err(err) => {
                let retryable = err.is_retryable() && !err.is_abort();
                let exhausted = {
                    let state = self.state.lock().await;
                    state
                        .registry
                        .get(&id)
                        .map(|t| t.retries >= t.max_retries)
                        .unwrap_or(true)
                };

                if retryable && !exhausted {
                    self.mutate_task(id, |task| {
                        task.retries += 1;
                        task.status = TaskStatus::Pending;
                        task.finished_at = Some(Utc::now());
                    })
                    .await;
                    self.requeue(id).await;
                } else {
                    let final_status = if err.is_abort() {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Failed
                    };
                    self.mutate_task(id, |task| {
                        task.status = final_status;
                        task.finished_at = Some(Utc::now());
                        task.error = Some(crate::task::TaskErrorInfo {
                            message: err.to_string(),
                            stack: None,
                        });
                    })
                    .await;
                    self.clear_current().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn noop_hook() -> AttemptHook {
        Arc::new(|_task: Task| Box::pin(async {}))
    }

    #[tokio::test]
    async fn runs_highest_priority_first() {
        let queue = Arc::new(TaskQueue::new(noop_hook(), noop_hook()));
        queue.start().await;

        let low = Task::new(None, "low".to_string(), Some(4));
        let high = Task::new(None, "high".to_string(), Some(0));
        queue.add(low.clone()).await;
        queue.add(high.clone()).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        queue
            .schedule(move |task| {
                let order = order_clone.clone();
                async move {
                    order.lock().await.push(task.input.clone());
                    Ok("done".to_string())
                }
            })
            .await;

        assert_eq!(*order.lock().await, vec!["high", "low"]);
    }

    #[tokio::test]
    async fn retry_then_success_tracks_attempts() {
        let queue = Arc::new(TaskQueue::new(noop_hook(), noop_hook()));
        queue.start().await;

        let mut task = Task::new(None, "flaky".to_string(), None);
        task.max_retries = 1;
        let task_id = task.id;
        queue.add(task).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        queue
            .schedule(move |_task| {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, AtomicOrdering::SeqCst);
                    if n == 0 {
                        Err(TaskError::Retryable(anyhow::anyhow!("transient failure")))
                    } else {
                        Ok("ok".to_string())
                    }
                }
            })
            .await;

        let settled = queue.get_task(task_id).await.unwrap();
        assert_eq!(settled.status, TaskStatus::Success);
        assert_eq!(settled.retries, 1);
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abort_like_error_is_cancelled_not_retried() {
        let queue = Arc::new(TaskQueue::new(noop_hook(), noop_hook()));
        queue.start().await;

        let mut task = Task::new(None, "aborted".to_string(), None);
        task.max_retries = 5;
        let task_id = task.id;
        queue.add(task).await;

        queue
            .schedule(|_task| async move {
                Err(TaskError::Retryable(anyhow::anyhow!(
                    "request aborted by user"
                )))
            })
            .await;

        let settled = queue.get_task(task_id).await.unwrap();
        assert_eq!(settled.status, TaskStatus::Cancelled);
        assert_eq!(settled.retries, 0);
    }

    #[tokio::test]
    async fn drain_pending_cancels_untouched_tasks() {
        let queue = Arc::new(TaskQueue::new(noop_hook(), noop_hook()));
        // Not started: tasks stay pending.
        let a = Task::new(None, "a".to_string(), None);
        let b = Task::new(None, "b".to_string(), None);
        queue.add(a.clone()).await;
        queue.add(b.clone()).await;

        let drained = queue.drain_pending("contextoverflow", "queue cleared").await;
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|t| t.status == TaskStatus::Cancelled));
        assert_eq!(queue.size().await, 0);
    }

    #[tokio::test]
    async fn at_most_one_task_running_at_a_time() {
        let queue = Arc::new(TaskQueue::new(noop_hook(), noop_hook()));
        queue.start().await;

        for i in 0..3 {
            queue.add(Task::new(None, format!("t{i}"), None)).await;
        }

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));
        let c1 = concurrent.clone();
        let m1 = max_concurrent.clone();
        queue
            .schedule(move |_task| {
                let c = c1.clone();
                let m = m1.clone();
                async move {
                    let now = c.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    m.fetch_max(now, AtomicOrdering::SeqCst);
                    c.fetch_sub(1, AtomicOrdering::SeqCst);
                    Ok("ok".to_string())
                }
            })
            .await;

        assert_eq!(max_concurrent.load(AtomicOrdering::SeqCst), 1);
    }
}
