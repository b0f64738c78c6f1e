//! Memory subsystem configuration and the workspace-relative persisted
//! state layout (`<workspace>/.agent/memory.jsonl`,
//! `<workspace>/.agent/memory-queue.wal`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::memory::{CaptureQueue, CoordinatorConfig, MemoryCoordinator, MemoryStore, PipelineMode, SearchMode};

/// The memory config object honored at the gateway boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MemoryConfig {
    pub enabled: bool,
    pub auto_capture: bool,
    pub auto_recall: bool,
    pub search_mode: String,
    pub max_recall_items: usize,
    pub min_capture_confidence: f64,
    pub pipeline_mode: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub flush_on_shutdown_timeout_ms: u64,
    pub recall_timeout_ms: u64,
    pub max_entries: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_capture: true,
            auto_recall: true,
            search_mode: "disabled".to_string(),
            max_recall_items: 8,
            min_capture_confidence: 0.3,
            pipeline_mode: "sync".to_string(),
            batch_size: 16,
            flush_interval_ms: 5_000,
            flush_on_shutdown_timeout_ms: 3_000,
            recall_timeout_ms: 1_500,
            max_entries: 5_000,
        }
    }
}

impl MemoryConfig {
    fn search_mode(&self) -> SearchMode {
        match self.search_mode.as_str() {
            "disabled" => SearchMode::Disabled,
            _ => SearchMode::FullText,
        }
    }

    fn pipeline_mode(&self) -> PipelineMode {
        match self.pipeline_mode.as_str() {
            "async_wal" => PipelineMode::AsyncWal,
            _ => PipelineMode::Sync,
        }
    }

    fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            enabled: self.enabled,
            auto_capture: self.auto_capture,
            auto_recall: self.auto_recall,
            max_recall_items: self.max_recall_items,
            min_capture_confidence: self.min_capture_confidence,
            pipeline_mode: self.pipeline_mode(),
            batch_size: self.batch_size,
            flush_interval_ms: self.flush_interval_ms,
            flush_on_shutdown_timeout_ms: self.flush_on_shutdown_timeout_ms,
            recall_timeout_ms: self.recall_timeout_ms,
        }
    }
}

/// Where a workspace's `.agent/` persisted state lives.
pub fn agent_dir(workspace: &Path) -> PathBuf {
    workspace.join(".agent")
}

pub fn memory_store_path(workspace: &Path) -> PathBuf {
    agent_dir(workspace).join("memory.jsonl")
}

pub fn capture_queue_path(workspace: &Path) -> PathBuf {
    agent_dir(workspace).join("memory-queue.wal")
}

/// Build the store/capture-queue/coordinator trio for a workspace,
/// per the memory config. `pool` is required only when `search_mode`
/// enables the full-text mirror.
pub async fn build_memory_coordinator(
    workspace: &Path,
    config: &MemoryConfig,
    pool: Option<PgPool>,
) -> anyhow::Result<Arc<MemoryCoordinator>> {
    let store = Arc::new(
        MemoryStore::load(memory_store_path(workspace), config.max_entries, config.search_mode(), pool).await?,
    );
    let capture_queue = Arc::new(CaptureQueue::load(capture_queue_path(workspace)).await?);
    let coordinator = Arc::new(MemoryCoordinator::new(config.coordinator_config(), store, capture_queue));
    coordinator.initialize().await?;
    Ok(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_config_defaults_match_documented_values() {
        let config = MemoryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.search_mode, "disabled");
        assert_eq!(config.pipeline_mode, "sync");
    }

    #[test]
    fn agent_dir_paths_are_workspace_relative() {
        let workspace = Path::new("/tmp/my-workspace");
        assert_eq!(memory_store_path(workspace), Path::new("/tmp/my-workspace/.agent/memory.jsonl"));
        assert_eq!(capture_queue_path(workspace), Path::new("/tmp/my-workspace/.agent/memory-queue.wal"));
    }

    #[tokio::test]
    async fn build_memory_coordinator_without_pool_works_with_disabled_search() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = MemoryConfig::default();
        let coordinator = build_memory_coordinator(tmp.path(), &config, None).await.unwrap();
        assert_eq!(coordinator.store().size().await, 0);
    }
}
