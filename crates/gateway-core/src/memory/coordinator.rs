//! Wires recall and capture into task execution: the component `gateway`
//! calls before and after running a task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::capture_queue::{CaptureJob, CaptureQueue};
use super::store::{MemoryEntry, MemoryStore};

/// How captured entries reach the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineMode {
    /// Capture candidates are upserted into the store synchronously, as
    /// part of `after_task`.
    Sync,
    /// Capture candidates are journaled to the capture queue and flushed
    /// on a timer, so `after_task` never blocks on a store write.
    AsyncWal,
}

/// Tunables governing the coordinator's behavior. Field names mirror the
/// persisted memory config object.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub enabled: bool,
    pub auto_capture: bool,
    pub auto_recall: bool,
    pub max_recall_items: usize,
    pub min_capture_confidence: f64,
    pub pipeline_mode: PipelineMode,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub flush_on_shutdown_timeout_ms: u64,
    pub recall_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_capture: true,
            auto_recall: true,
            max_recall_items: 8,
            min_capture_confidence: 0.3,
            pipeline_mode: PipelineMode::Sync,
            batch_size: 16,
            flush_interval_ms: 5_000,
            flush_on_shutdown_timeout_ms: 3_000,
            recall_timeout_ms: 1_500,
        }
    }
}

/// A block injected before a task runs, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct RecallBlock {
    pub block_id: String,
    pub content: String,
    pub entry_type: String,
    pub persistent_score: f64,
}

struct FlushState {
    timer: Option<JoinHandle<()>>,
}

/// Coordinates recall-before/capture-after around task execution.
pub struct MemoryCoordinator {
    config: CoordinatorConfig,
    store: Arc<MemoryStore>,
    capture_queue: Arc<CaptureQueue>,
    flush_state: Mutex<FlushState>,
    flushing: AtomicBool,
}

impl MemoryCoordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<MemoryStore>, capture_queue: Arc<CaptureQueue>) -> Self {
        Self {
            config,
            store,
            capture_queue,
            flush_state: Mutex::new(FlushState { timer: None }),
            flushing: AtomicBool::new(false),
        }
    }

    /// Start the background flush timer (only meaningful in `AsyncWal`
    /// mode) and flush immediately if the queue is non-empty from a prior
    /// run.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if !self.config.enabled || self.config.pipeline_mode != PipelineMode::AsyncWal {
            return Ok(());
        }

        if self.capture_queue.size().await > 0 {
            self.flush_once().await?;
        }

        let coordinator = Arc::clone(self);
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(100));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = coordinator.flush_once().await {
                    tracing::error!(error = %err, "periodic memory capture flush failed");
                }
            }
        });

        self.flush_state.lock().await.timer = Some(handle);
        Ok(())
    }

    /// Stop the timer and, given a bounded budget, drain the capture queue.
    pub async fn dispose(&self) -> Result<()> {
        if let Some(handle) = self.flush_state.lock().await.timer.take() {
            handle.abort();
        }
        if self.config.pipeline_mode == PipelineMode::AsyncWal {
            let budget = Duration::from_millis(self.config.flush_on_shutdown_timeout_ms);
            let _ = tokio::time::timeout(budget, self.drain_all()).await;
        }
        Ok(())
    }

    async fn drain_all(&self) -> Result<()> {
        while self.capture_queue.size().await > 0 {
            self.flush_once().await?;
        }
        Ok(())
    }

    /// Flush up to `batch_size` queued jobs into the store. Re-entrant
    /// calls (e.g. a manual flush racing the timer) are no-ops.
    async fn flush_once(&self) -> Result<()> {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.flush_once_inner().await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    async fn flush_once_inner(&self) -> Result<()> {
        let batch = self.capture_queue.peek_batch(self.config.batch_size).await;
        if batch.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = batch.iter().map(|j| j.job_id).collect();
        let entries: Vec<MemoryEntry> = batch.into_iter().map(|j| j.entry).collect();
        self.store.upsert(entries).await?;
        self.capture_queue.ack(&ids).await?;
        Ok(())
    }

    /// Recall blocks to inject before a task starts, excluding anything
    /// already present in the task's working set.
    pub async fn before_task(&self, exclude_block_ids: &[String]) -> Vec<RecallBlock> {
        if !self.config.enabled || !self.config.auto_recall {
            return Vec::new();
        }

        let budget = Duration::from_millis(self.config.recall_timeout_ms);
        let recalled = tokio::time::timeout(budget, self.store.recall(exclude_block_ids, self.config.max_recall_items)).await;

        let entries = match recalled {
            Ok(entries) => entries,
            Err(_) => {
                tracing::warn!("memory recall timed out, proceeding without injected context");
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .map(|entry| RecallBlock {
                persistent_score: 0.5 * (1.0 - entry.decay) + 0.5 * entry.confidence,
                block_id: entry.block_id,
                content: entry.content,
                entry_type: entry.entry_type,
            })
            .collect()
    }

    /// Capture candidate entries produced by a finished task. Entries below
    /// `min_capture_confidence` are dropped.
    pub async fn after_task(&self, source_task_id: Uuid, candidates: Vec<MemoryEntry>) -> Result<()> {
        if !self.config.enabled || !self.config.auto_capture {
            return Ok(());
        }

        let accepted: Vec<MemoryEntry> = candidates
            .into_iter()
            .filter(|c| c.confidence >= self.config.min_capture_confidence)
            .map(|mut c| {
                c.source_task_id = Some(source_task_id);
                c
            })
            .collect();

        if accepted.is_empty() {
            return Ok(());
        }

        match self.config.pipeline_mode {
            PipelineMode::Sync => {
                self.store.upsert(accepted).await?;
            }
            PipelineMode::AsyncWal => {
                let now = Utc::now();
                for entry in accepted {
                    self.capture_queue
                        .enqueue(CaptureJob {
                            job_id: Uuid::new_v4(),
                            entry,
                            enqueued_at: now,
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::SearchMode;

    fn entry(block_id: &str, confidence: f64) -> MemoryEntry {
        MemoryEntry {
            block_id: block_id.to_string(),
            entry_type: "core".to_string(),
            content: "some content".to_string(),
            tags: vec![],
            confidence,
            decay: 0.1,
            round: 1,
            source_task_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            recall_count: 0,
            feedback_score: 0.0,
        }
    }

    async fn coordinator(mode: PipelineMode) -> (Arc<MemoryCoordinator>, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::load(tmp.path().join("memory.jsonl"), 100, SearchMode::Disabled, None).await.unwrap());
        let capture_queue = Arc::new(CaptureQueue::load(tmp.path().join("queue.wal")).await.unwrap());
        let mut config = CoordinatorConfig::default();
        config.pipeline_mode = mode;
        (Arc::new(MemoryCoordinator::new(config, store, capture_queue)), tmp)
    }

    #[tokio::test]
    async fn after_task_sync_mode_writes_directly_to_store() {
        let (coordinator, _tmp) = coordinator(PipelineMode::Sync).await;
        coordinator.after_task(Uuid::new_v4(), vec![entry("core:x", 0.9)]).await.unwrap();
        assert_eq!(coordinator.store().size().await, 1);
    }

    #[tokio::test]
    async fn after_task_drops_low_confidence_candidates() {
        let (coordinator, _tmp) = coordinator(PipelineMode::Sync).await;
        coordinator.after_task(Uuid::new_v4(), vec![entry("core:x", 0.05)]).await.unwrap();
        assert_eq!(coordinator.store().size().await, 0);
    }

    #[tokio::test]
    async fn after_task_async_wal_mode_enqueues_without_writing_store() {
        let (coordinator, _tmp) = coordinator(PipelineMode::AsyncWal).await;
        coordinator.after_task(Uuid::new_v4(), vec![entry("core:x", 0.9)]).await.unwrap();
        assert_eq!(coordinator.store().size().await, 0);

        coordinator.flush_once().await.unwrap();
        assert_eq!(coordinator.store().size().await, 1);
    }

    #[tokio::test]
    async fn before_task_excludes_given_ids() {
        let (coordinator, _tmp) = coordinator(PipelineMode::Sync).await;
        coordinator
            .store()
            .upsert(vec![entry("core:a", 0.9), entry("core:b", 0.9)])
            .await
            .unwrap();

        let blocks = coordinator.before_task(&["core:a".to_string()]).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].block_id, "core:b");
    }

    #[tokio::test]
    async fn dispose_drains_pending_async_wal_jobs() {
        let (coordinator, _tmp) = coordinator(PipelineMode::AsyncWal).await;
        coordinator.after_task(Uuid::new_v4(), vec![entry("core:x", 0.9)]).await.unwrap();
        coordinator.dispose().await.unwrap();
        assert_eq!(coordinator.store().size().await, 1);
    }
}
