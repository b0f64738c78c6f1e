//! Cross-subsystem scenarios that only make sense driven through the whole
//! `GatewayService`: context-overflow queue purge and force abort.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use gateway_core::driver::{AgentDriver, AttemptOutcome, ContextSnapshot, DriverResult, MessageSink, TaskContext};
use gateway_core::gateway::{CreateTaskRequest, GatewayService};
use gateway_core::message::MessageBuffer;
use gateway_core::task::TaskStatus;

/// Fails its first attempt with a context-overflow-shaped message after a
/// short delay (so a second task can be queued behind it), then succeeds.
struct OverflowOnceDriver {
    attempts: AtomicUsize,
}

#[async_trait]
impl AgentDriver for OverflowOnceDriver {
    fn name(&self) -> &str {
        "overflow-once"
    }

    async fn begin_task_context(&self, _ctx: TaskContext, _sink: MessageSink) -> anyhow::Result<DriverResult> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt == 0 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            anyhow::bail!("Error: maximum context length exceeded for this request");
        }
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

#[tokio::test]
async fn context_overflow_purges_pending_queue_then_retries_current() {
    let gateway = GatewayService::new(
        Arc::new(OverflowOnceDriver { attempts: AtomicUsize::new(0) }),
        Arc::new(MessageBuffer::new()),
        None,
    );
    gateway.start().await;

    let first_gateway = Arc::clone(&gateway);
    let first_handle = tokio::spawn(async move {
        first_gateway
            .submit_task(CreateTaskRequest { task_type: None, input: "a".to_string(), priority: None })
            .await
    });

    // Give the first task time to be claimed and start its slow attempt
    // before queuing the second one behind it.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = gateway
        .submit_task(CreateTaskRequest { task_type: None, input: "b".to_string(), priority: None })
        .await
        .unwrap();

    let first = first_handle.await.unwrap().unwrap();

    let first_fetched = gateway.get_task(first.task_id, None).await.unwrap();
    assert_eq!(first_fetched.task.status, TaskStatus::Success);
    assert_eq!(first_fetched.task.retries, 1);

    let second_fetched = gateway.get_task(second.task_id, None).await.unwrap();
    assert_eq!(second_fetched.task.status, TaskStatus::Cancelled);
    assert!(
        second_fetched
            .messages
            .items
            .iter()
            .any(|m| format!("{:?}", m.body).contains("context length overflow"))
    );
}

/// A driver that blocks until aborted, reporting how many times abort was
/// actually signaled.
struct BlockingDriver {
    abort_flag: tokio::sync::Notify,
}

#[async_trait]
impl AgentDriver for BlockingDriver {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn begin_task_context(&self, _ctx: TaskContext, _sink: MessageSink) -> anyhow::Result<DriverResult> {
        self.abort_flag.notified().await;
        Ok(DriverResult {
            completed: false,
            stop_reason: None,
            segment_count: 1,
            total_tool_calls: 0,
            total_model_steps: 0,
        })
    }

    async fn finish_task_context(&self, _task_id: Uuid, _outcome: AttemptOutcome) {}

    async fn abort(&self) -> bool {
        self.abort_flag.notify_one();
        true
    }

    async fn context_snapshot(&self) -> Option<ContextSnapshot> {
        None
    }
}

#[tokio::test]
async fn force_abort_interrupts_current_task_and_drains_pending() {
    let driver = Arc::new(BlockingDriver { abort_flag: tokio::sync::Notify::new() });
    let gateway = GatewayService::new(driver, Arc::new(MessageBuffer::new()), None);
    gateway.start().await;

    let current_gateway = Arc::clone(&gateway);
    let current_handle = tokio::spawn(async move {
        current_gateway
            .submit_task(CreateTaskRequest { task_type: None, input: "current".to_string(), priority: None })
            .await
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    let pending = gateway
        .submit_task(CreateTaskRequest { task_type: None, input: "pending".to_string(), priority: None })
        .await
        .unwrap();

    let response = gateway.force_abort().await;
    assert!(response.aborted_current);
    assert_eq!(response.cleared_pending_count, 1);

    let current = current_handle.await.unwrap().unwrap();
    let current_fetched = gateway.get_task(current.task_id, None).await.unwrap();
    assert_eq!(current_fetched.task.status, TaskStatus::Cancelled);

    let pending_fetched = gateway.get_task(pending.task_id, None).await.unwrap();
    assert_eq!(pending_fetched.task.status, TaskStatus::Cancelled);
}
