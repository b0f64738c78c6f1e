//! Write-ahead journal for memory entries awaiting capture, used by the
//! `async_wal` pipeline mode so a task's response is never blocked on a
//! store write.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::store::MemoryEntry;

/// One pending capture, queued for an eventual `MemoryStore::upsert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureJob {
    pub job_id: Uuid,
    pub entry: MemoryEntry,
    pub enqueued_at: DateTime<Utc>,
}

struct QueueState {
    jobs: Vec<CaptureJob>,
}

/// Append-only file-backed queue of [`CaptureJob`]s.
///
/// Jobs are identified by `job_id`; `enqueue` on an existing id replaces it
/// in place. The whole file is rewritten on every mutation, which is
/// acceptable at the capture-queue's expected scale (bounded by
/// `batch_size` and flush interval).
pub struct CaptureQueue {
    path: PathBuf,
    state: Mutex<QueueState>,
}

impl CaptureQueue {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let jobs = load_jobs(&path).await?;
        Ok(Self {
            path,
            state: Mutex::new(QueueState { jobs }),
        })
    }

    /// Enqueue a job, replacing any existing job with the same id.
    pub async fn enqueue(&self, job: CaptureJob) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.jobs.iter_mut().find(|j| j.job_id == job.job_id) {
            *existing = job;
        } else {
            state.jobs.push(job);
        }
        persist_jobs(&self.path, &state.jobs).await
    }

    /// Return up to `n` oldest jobs (by `enqueued_at`, ties broken by
    /// `job_id`), without removing them.
    pub async fn peek_batch(&self, n: usize) -> Vec<CaptureJob> {
        let state = self.state.lock().await;
        let mut jobs = state.jobs.clone();
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.job_id.cmp(&b.job_id)));
        jobs.truncate(n);
        jobs
    }

    /// Remove acknowledged jobs from the queue.
    pub async fn ack(&self, job_ids: &[Uuid]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.jobs.retain(|j| !job_ids.contains(&j.job_id));
        persist_jobs(&self.path, &state.jobs).await
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}

async fn load_jobs(path: &Path) -> Result<Vec<CaptureJob>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read capture queue at {}", path.display())),
    };

    let mut jobs = Vec::new();
    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CaptureJob>(line) {
            Ok(job) => jobs.push(job),
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "skipping malformed capture queue line");
            }
        }
    }
    Ok(jobs)
}

async fn persist_jobs(path: &Path, jobs: &[CaptureJob]) -> Result<()> {
    let mut buf = String::new();
    for job in jobs {
        buf.push_str(&serde_json::to_string(job).context("failed to serialize capture job")?);
        buf.push('\n');
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    tokio::fs::write(path, buf).await.with_context(|| format!("failed to write capture queue at {}", path.display()))?;
    Ok(())
}
