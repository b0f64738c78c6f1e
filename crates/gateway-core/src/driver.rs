//! The `AgentDriver` trait -- the adapter interface for the model/tool
//! execution engine that actually runs a task.
//!
//! The driver's own implementation (process spawning, model calls, tool
//! dispatch) is out of scope for this crate; only the boundary the gateway
//! consumes is specified here, generalized from this codebase's harness
//! adapter trait from subprocess spawning to the task-context lifecycle the
//! gateway actually drives.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::message::MessageDraft;
use crate::task::StopReason;

/// Async output-message sink handed to a driver for the lifetime of one
/// attempt. Boxed as a future-returning `Fn` rather than a bare callback so
/// the gateway can await the append landing in the buffer instead of racing
/// a detached task against the attempt's own completion.
pub type MessageSink = std::sync::Arc<dyn Fn(MessageDraft) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// One attempt's worth of context handed to the driver when a task starts.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub task_type: String,
    pub input: String,
    pub retries: u32,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// How an attempt concluded, passed to `finish_task_context`.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Success,
    Failed,
    Cancelled,
    /// The attempt is being requeued as `pending`; the driver should
    /// preserve any checkpoint rather than tearing context down.
    Requeued,
}

/// The driver's report on how one task execution concluded.
#[derive(Debug, Clone)]
pub struct DriverResult {
    pub completed: bool,
    pub stop_reason: Option<StopReason>,
    pub segment_count: u32,
    pub total_tool_calls: u32,
    pub total_model_steps: u32,
}

/// A snapshot of the driver's current context, for `get_agent_context`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ContextSnapshot {
    pub context: serde_json::Value,
    pub injected_context: serde_json::Value,
    pub projection_debug: serde_json::Value,
}

/// Adapter interface for the long-running model/tool execution engine the
/// gateway drives one task at a time.
///
/// # Object Safety
///
/// Every method returns a concrete type, a boxed stream, or `()`, so the
/// trait can be stored as `Arc<dyn AgentDriver>`.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    /// Human-readable name for this driver.
    fn name(&self) -> &str;

    /// Begin a new task attempt. The driver should start executing `ctx`,
    /// emitting output-message drafts through `sink` as it goes.
    async fn begin_task_context(&self, ctx: TaskContext, sink: MessageSink) -> anyhow::Result<DriverResult>;

    /// Notify the driver that the attempt for `task_id` has settled.
    async fn finish_task_context(&self, task_id: Uuid, outcome: AttemptOutcome);

    /// Abort the currently running task, if any. Returns whether anything
    /// was actually interrupted.
    async fn abort(&self) -> bool;

    /// Return a projection snapshot of the driver's current context, if
    /// supported.
    async fn context_snapshot(&self) -> Option<ContextSnapshot>;

    /// Stream of raw driver events, primarily for diagnostics; the gateway
    /// itself only consumes message drafts via the sink.
    fn events(&self) -> Pin<Box<dyn Stream<Item = MessageDraft> + Send>> {
        Box::pin(futures::stream::empty())
    }
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentDriver) {}
};

/// A driver that does nothing, used in tests to exercise the gateway
/// without a real model/tool execution engine.
pub struct NoopDriver;

#[async_trait]
impl AgentDriver for NoopDriver {
    fn name(&self) -> &str {
        "noop"
    }

    async fn begin_task_context(&self, _ctx: TaskContext, _sink: MessageSink) -> anyhow::Result<DriverResult> {
        Ok(DriverResult {
            completed: true,
            stop_reason: None,
            segment_count: 1,
            total_tool_calls: 0,
            total_model_steps: 0,
        })
    }

    async fn finish_task_context(&self, _task_id: Uuid, _outcome: AttemptOutcome) {}

    async fn abort(&self) -> bool {
        false
    }

    async fn context_snapshot(&self) -> Option<ContextSnapshot> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn agent_driver_is_object_safe() {
        let driver: Arc<dyn AgentDriver> = Arc::new(NoopDriver);
        assert_eq!(driver.name(), "noop");
    }

    #[tokio::test]
    async fn noop_driver_completes_without_stop_reason() {
        let driver = NoopDriver;
        let ctx = TaskContext {
            task_id: Uuid::new_v4(),
            task_type: "http.input".to_string(),
            input: "hello".to_string(),
            retries: 0,
            started_at: chrono::Utc::now(),
        };
        let sink: MessageSink = Arc::new(|_draft| Box::pin(async {}));
        let result = driver.begin_task_context(ctx, sink).await.unwrap();
        assert!(result.completed);
        assert!(result.stop_reason.is_none());
        assert!(!driver.abort().await);
    }
}
