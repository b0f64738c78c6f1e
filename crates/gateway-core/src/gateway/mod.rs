//! The runtime gateway service: the composition root tying the task queue,
//! message buffer, scheduler, and memory coordinator to one agent driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::driver::{AgentDriver, AttemptOutcome, MessageSink, TaskContext};
use crate::error::{is_context_overflow_message, TaskError};
use crate::memory::{FeedbackDirection, MemoryCoordinator, MemoryEntry, ScoredEntry};
use crate::message::{MessageBuffer, MessageDelta, MessageDraft, OtherMessage, TaskMessageBody};
use crate::scheduler::{CreateScheduleRequest, ScheduleManager};
use crate::task::{Task, TaskQueue, TaskStatus};

/// `CreateTaskRequest`: the public shape accepted by `submit_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub input: String,
    pub priority: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitTaskResponse {
    pub task_id: Uuid,
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetTaskResponse {
    pub task: Task,
    pub messages: MessageDelta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceAbortResponse {
    pub aborted_current: bool,
    pub cleared_pending_count: usize,
    pub timestamp: chrono::DateTime<Utc>,
}

/// The composition root. `submit_task`, `get_task`, `get_queue_stats`, and
/// `force_abort` are the surface a transport layer (out of scope here)
/// would wrap.
pub struct GatewayService {
    driver: Arc<dyn AgentDriver>,
    queue: Arc<TaskQueue>,
    buffer: Arc<MessageBuffer>,
    memory: Option<Arc<MemoryCoordinator>>,
    scheduler: tokio::sync::RwLock<Option<Arc<ScheduleManager>>>,
    system_prompt: tokio::sync::RwLock<Option<String>>,
    /// Set just before `force_abort` signals the driver, so the in-flight
    /// attempt's non-completion can be told apart from a driver-initiated
    /// controlled stop. Safe as a single flag because the executor is
    /// strictly serial -- at most one attempt is ever in flight.
    abort_requested: AtomicBool,
    /// Block ids already recalled into a task's context, keyed by task id,
    /// so a later attempt (on retry) doesn't recall the same blocks again.
    recalled_blocks: tokio::sync::Mutex<HashMap<Uuid, Vec<String>>>,
}

impl GatewayService {
    pub fn new(
        driver: Arc<dyn AgentDriver>,
        buffer: Arc<MessageBuffer>,
        memory: Option<Arc<MemoryCoordinator>>,
    ) -> Arc<Self> {
        let buffer_for_start = Arc::clone(&buffer);
        let buffer_for_settle = Arc::clone(&buffer);
        let on_attempt_start: crate::task::AttemptHook = Arc::new(move |task: Task| {
            let buffer = Arc::clone(&buffer_for_start);
            Box::pin(async move {
                buffer
                    .append(
                        task.id,
                        MessageDraft {
                            body: TaskMessageBody::Other(OtherMessage::Status {
                                text: "Task running".to_string(),
                            }),
                            created_at: None,
                            raw_step: None,
                        },
                    )
                    .await;
            })
        });
        let on_attempt_settled: crate::task::AttemptHook = Arc::new(move |task: Task| {
            let buffer = Arc::clone(&buffer_for_settle);
            let text = match task.status {
                TaskStatus::Success => "Task succeeded".to_string(),
                TaskStatus::Failed => "Task failed".to_string(),
                TaskStatus::Cancelled => "Task cancelled".to_string(),
                TaskStatus::Pending => "Task requeued for retry".to_string(),
                TaskStatus::Running => "Task running".to_string(),
            };
            Box::pin(async move {
                buffer
                    .append(
                        task.id,
                        MessageDraft {
                            body: TaskMessageBody::Other(OtherMessage::Status { text }),
                            created_at: None,
                            raw_step: None,
                        },
                    )
                    .await;
            })
        });

        Arc::new(Self {
            driver,
            queue: Arc::new(TaskQueue::new(on_attempt_start, on_attempt_settled)),
            buffer,
            memory,
            scheduler: tokio::sync::RwLock::new(None),
            system_prompt: tokio::sync::RwLock::new(None),
            abort_requested: AtomicBool::new(false),
            recalled_blocks: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Wire a scheduler into this gateway after construction -- the
    /// scheduler's `on_trigger` callback needs an `Arc<GatewayService>` to
    /// call `submit_task` on, so it can only be built once the gateway
    /// already exists.
    pub async fn attach_scheduler(&self, scheduler: Arc<ScheduleManager>) {
        *self.scheduler.write().await = Some(scheduler);
    }

    pub async fn start(self: &Arc<Self>) {
        self.queue.start().await;
        if let Some(scheduler) = self.scheduler.read().await.clone() {
            if let Err(err) = scheduler.restart().await {
                tracing::error!(error = %err, "failed to replay schedules on startup");
            }
        }
        self.drive().await;
    }

    pub async fn stop(&self) {
        self.queue.stop().await;
        if let Some(memory) = &self.memory {
            if let Err(err) = memory.dispose().await {
                tracing::error!(error = %err, "memory coordinator dispose failed");
            }
        }
    }

    pub async fn update_system_prompt(&self, prompt: Option<String>) {
        *self.system_prompt.write().await = prompt;
    }

    /// Accept a new task, register it, and append its initial status
    /// message before returning -- a subsequent `get_task(after_seq=0)` is
    /// guaranteed to observe it. Rejects an out-of-range `priority` before
    /// the task is ever constructed.
    pub async fn submit_task(self: &Arc<Self>, req: CreateTaskRequest) -> Result<SubmitTaskResponse> {
        if let Some(priority) = req.priority {
            if priority > 4 {
                bail!("priority must be in 0..4, got {priority}");
            }
        }

        let task = Task::new(req.task_type, req.input, req.priority);
        let task_id = task.id;
        self.queue.add(task.clone()).await;
        self.buffer
            .append(
                task_id,
                MessageDraft {
                    body: TaskMessageBody::Other(OtherMessage::Status {
                        text: "Task queued".to_string(),
                    }),
                    created_at: None,
                    raw_step: None,
                },
            )
            .await;

        self.drive().await;
        Ok(SubmitTaskResponse { task_id, task })
    }

    pub async fn get_task(&self, task_id: Uuid, after_seq: Option<u64>) -> Option<GetTaskResponse> {
        let task = self.queue.get_task(task_id).await?;
        let messages = self.buffer.delta(task_id, after_seq.unwrap_or(0)).await;
        Some(GetTaskResponse { task, messages })
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        QueueStats { size: self.queue.size().await }
    }

    pub async fn get_agent_context(&self) -> serde_json::Value {
        match self.driver.context_snapshot().await {
            Some(snapshot) => serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null),
            None => serde_json::json!({
                "context": serde_json::Value::Null,
                "injected_context": serde_json::Value::Null,
                "projection_debug": { "memory_enabled": self.memory.is_some() },
            }),
        }
    }

    pub async fn get_agent_messages(&self, task_id: Uuid) -> MessageDelta {
        self.buffer.delta(task_id, 0).await
    }

    /// Annotate the running task, invoke the driver's abort hook, drain
    /// pending tasks as cancelled, and report what was interrupted.
    pub async fn force_abort(&self) -> ForceAbortResponse {
        let current = self.queue.current_task().await;
        if let Some(current) = &current {
            self.buffer
                .append(
                    current.id,
                    MessageDraft {
                        body: TaskMessageBody::Other(OtherMessage::Status {
                            text: "Task cancelled by force abort".to_string(),
                        }),
                        created_at: None,
                        raw_step: None,
                    },
                )
                .await;
        }

        // Only arm the abort-in-flight flag when there's actually an
        // attempt to interrupt, so an idle `force_abort` can't make an
        // unrelated later task's controlled stop look like an abort.
        if current.is_some() {
            self.abort_requested.store(true, Ordering::SeqCst);
        }
        let aborted_current = self.driver.abort().await;
        let drained = self.queue.drain_pending("forceabort", "Task cancelled by force abort").await;
        for task in &drained {
            self.buffer
                .append(
                    task.id,
                    MessageDraft {
                        body: TaskMessageBody::Other(OtherMessage::Status {
                            text: "Task cancelled by force abort".to_string(),
                        }),
                        created_at: None,
                        raw_step: None,
                    },
                )
                .await;
        }

        ForceAbortResponse {
            aborted_current,
            cleared_pending_count: drained.len(),
            timestamp: Utc::now(),
        }
    }

    pub async fn memory_upsert(&self, task_id: Uuid, entries: Vec<MemoryEntry>) -> Result<()> {
        match &self.memory {
            Some(memory) => memory.after_task(task_id, entries).await,
            None => Ok(()),
        }
    }

    pub async fn memory_get(&self, block_id: &str) -> Option<MemoryEntry> {
        match &self.memory {
            Some(memory) => memory.store().get(block_id).await,
            None => None,
        }
    }

    pub async fn memory_search(&self, query: &str, limit: usize) -> Vec<ScoredEntry> {
        match &self.memory {
            Some(memory) => memory.store().search_relevant(query, limit, &[]).await,
            None => Vec::new(),
        }
    }

    pub async fn memory_feedback(&self, block_id: &str, direction: FeedbackDirection) -> Result<()> {
        match &self.memory {
            Some(memory) => memory.store().feedback(block_id, direction).await,
            None => Ok(()),
        }
    }

    pub async fn memory_stats(&self) -> serde_json::Value {
        match &self.memory {
            Some(memory) => serde_json::json!({ "size": memory.store().size().await }),
            None => serde_json::json!({ "enabled": false }),
        }
    }

    pub async fn create_schedule(&self, req: CreateScheduleRequest) -> Result<gateway_db::models::ScheduleRow> {
        let scheduler = self.scheduler.read().await.clone();
        let scheduler = scheduler.ok_or_else(|| anyhow::anyhow!("scheduler is not configured"))?;
        scheduler.create(req).await
    }

    pub async fn list_schedules(&self) -> Result<Vec<gateway_db::models::ScheduleRow>> {
        match self.scheduler.read().await.clone() {
            Some(scheduler) => scheduler.list().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_schedule(&self, schedule_id: Uuid) -> Result<Option<gateway_db::models::ScheduleRow>> {
        match self.scheduler.read().await.clone() {
            Some(scheduler) => scheduler.get(schedule_id).await,
            None => Ok(None),
        }
    }

    pub async fn cancel_schedule(&self, schedule_id: Uuid) -> Result<bool> {
        match self.scheduler.read().await.clone() {
            Some(scheduler) => scheduler.cancel(schedule_id).await,
            None => Ok(false),
        }
    }

    /// Drive the queue: claim and run one task attempt after another until
    /// nothing remains claimable. Implements the context-overflow queue
    /// purge inline in the executor closure.
    async fn drive(self: &Arc<Self>) {
        let gateway = Arc::clone(self);
        self.queue
            .clone()
            .schedule(move |task| {
                let gateway = Arc::clone(&gateway);
                async move { gateway.run_agent_task(task).await }
            })
            .await;
    }

    async fn run_agent_task(self: &Arc<Self>, task: Task) -> Result<String, TaskError> {
        let task_id = task.id;

        let already_recalled = self
            .recalled_blocks
            .lock()
            .await
            .get(&task_id)
            .cloned()
            .unwrap_or_default();
        let recall_blocks = match &self.memory {
            Some(memory) => memory.before_task(&already_recalled).await,
            None => Vec::new(),
        };
        if !recall_blocks.is_empty() {
            let mut recalled = self.recalled_blocks.lock().await;
            let entry = recalled.entry(task_id).or_default();
            for block in &recall_blocks {
                entry.push(block.block_id.clone());
            }
        }
        for block in &recall_blocks {
            self.buffer
                .append(
                    task_id,
                    MessageDraft {
                        body: TaskMessageBody::Other(OtherMessage::Status {
                            text: format!("recalled {}", block.block_id),
                        }),
                        created_at: None,
                        raw_step: None,
                    },
                )
                .await;
        }

        let buffer = Arc::clone(&self.buffer);
        let sink_task_id = task_id;
        let sink: MessageSink = Arc::new(move |draft: MessageDraft| {
            let buffer = Arc::clone(&buffer);
            Box::pin(async move {
                buffer.append(sink_task_id, draft).await;
            })
        });

        let ctx = TaskContext {
            task_id,
            task_type: task.task_type.clone(),
            input: task.input.clone(),
            retries: task.retries,
            started_at: Utc::now(),
        };

        let result = self.driver.begin_task_context(ctx, sink).await;

        match result {
            Ok(driver_result) if !driver_result.completed => {
                self.driver.finish_task_context(task_id, AttemptOutcome::Cancelled).await;
                if self.abort_requested.swap(false, Ordering::SeqCst) {
                    self.recalled_blocks.lock().await.remove(&task_id);
                    Err(TaskError::Abort)
                } else {
                    Err(TaskError::ControlledStop(
                        driver_result
                            .stop_reason
                            .unwrap_or(crate::task::StopReason::ContinuationLimitReached),
                    ))
                }
            }
            Ok(_) => {
                self.driver.finish_task_context(task_id, AttemptOutcome::Success).await;
                if let Some(memory) = &self.memory {
                    let _ = memory.after_task(task_id, Vec::new()).await;
                }
                self.recalled_blocks.lock().await.remove(&task_id);
                Ok("ok".to_string())
            }
            Err(err) if is_context_overflow_message(&err.to_string()) => {
                self.driver.finish_task_context(task_id, AttemptOutcome::Failed).await;
                self.purge_on_context_overflow(task_id).await;
                Err(TaskError::Retryable(err))
            }
            Err(err) => {
                self.driver.finish_task_context(task_id, AttemptOutcome::Failed).await;
                Err(TaskError::Retryable(err))
            }
        }
    }

    async fn purge_on_context_overflow(&self, task_id: Uuid) {
        self.buffer
            .append(
                task_id,
                MessageDraft {
                    body: TaskMessageBody::Other(OtherMessage::Status {
                        text: "Task cancelled: queue cleared after context length overflow".to_string(),
                    }),
                    created_at: None,
                    raw_step: None,
                },
            )
            .await;

        let drained = self.queue.drain_pending("contextoverflow", "queue cleared after context length overflow").await;
        for task in &drained {
            self.buffer
                .append(
                    task.id,
                    MessageDraft {
                        body: TaskMessageBody::Other(OtherMessage::Status {
                            text: "Task cancelled: queue cleared after context length overflow".to_string(),
                        }),
                        created_at: None,
                        raw_step: None,
                    },
                )
                .await;
        }
    }
}
