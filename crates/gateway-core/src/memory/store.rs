//! Keyed persistent memory block store: file-backed journal of record, with
//! an optional Postgres full-text mirror for relevance search.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use gateway_db::queries::memory_fts;

use super::canonicalize_block_id;

/// A single persistent memory block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub block_id: String,
    pub entry_type: String,
    pub content: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub decay: f64,
    pub round: u32,
    pub source_task_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of times this entry has been returned by `search_relevant`.
    /// Feeds the composite score's `recall_count_normalized` term.
    #[serde(default)]
    pub recall_count: u32,
    /// Accumulated feedback signal in `[-1.0, 1.0]`, nudged by `feedback()`.
    #[serde(default)]
    pub feedback_score: f64,
}

/// Direction of a `feedback` call against a memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackDirection {
    Positive,
    Negative,
}

impl fmt::Display for FeedbackDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Negative => write!(f, "negative"),
        }
    }
}

impl std::str::FromStr for FeedbackDirection {
    type Err = FeedbackDirectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "negative" => Ok(Self::Negative),
            other => Err(FeedbackDirectionParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeedbackDirectionParseError(pub String);

impl fmt::Display for FeedbackDirectionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid feedback direction: {:?}", self.0)
    }
}

impl std::error::Error for FeedbackDirectionParseError {}

/// Outcome of an `upsert` call, aggregated across every entry in the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// How a search should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Disabled,
    FullText,
}

/// A search hit: the entry plus its computed relevance score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f64,
}

struct StoreState {
    entries: HashMap<String, MemoryEntry>,
}

/// The keyed persistent memory store.
///
/// Reads/writes are serialized through an in-process `RwLock` so the
/// primary file-backed form is linearizable without a database round trip.
/// When full-text search is enabled, entries are additionally mirrored
/// into Postgres for `ts_rank` scoring.
pub struct MemoryStore {
    path: PathBuf,
    max_entries: usize,
    search_mode: SearchMode,
    pool: Option<PgPool>,
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Load (or initialize) a store backed by `path`. Malformed lines are
    /// skipped with a warning rather than failing the whole load.
    pub async fn load(path: impl Into<PathBuf>, max_entries: usize, search_mode: SearchMode, pool: Option<PgPool>) -> Result<Self> {
        let path = path.into();
        let entries = load_entries(&path).await?;
        Ok(Self {
            path,
            max_entries,
            search_mode,
            pool,
            state: RwLock::new(StoreState { entries }),
        })
    }

    /// Insert or update entries. Entries of a recall-like type are skipped.
    /// After all writes, evicts the oldest (by `updated_at`, ties broken by
    /// ascending canonical block id) until within `max_entries`.
    pub async fn upsert(&self, mut entries: Vec<MemoryEntry>) -> Result<UpsertStats> {
        let mut stats = UpsertStats::default();
        let mut state = self.state.write().await;
        let mut changed = false;

        for entry in entries.drain(..) {
            if super::RECALL_LIKE_TYPES.contains(&entry.entry_type.as_str()) {
                stats.skipped += 1;
                continue;
            }
            let canonical_id = canonicalize_block_id(&entry.block_id);
            if canonical_id.is_empty() {
                stats.skipped += 1;
                continue;
            }
            let mut entry = entry;
            entry.block_id = canonical_id.clone();

            match state.entries.get(&canonical_id) {
                Some(existing) if existing.content == entry.content && existing.tags == entry.tags => {
                    stats.unchanged += 1;
                }
                Some(_) => {
                    stats.updated += 1;
                    changed = true;
                    state.entries.insert(canonical_id, entry);
                }
                None => {
                    stats.inserted += 1;
                    changed = true;
                    state.entries.insert(canonical_id, entry);
                }
            }
        }

        if state.entries.len() > self.max_entries {
            let mut sorted: Vec<(String, DateTime<Utc>)> = state
                .entries
                .values()
                .map(|e| (e.block_id.clone(), e.updated_at))
                .collect();
            sorted.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let excess = state.entries.len() - self.max_entries;
            for (block_id, _) in sorted.into_iter().take(excess) {
                state.entries.remove(&block_id);
                if let Some(pool) = &self.pool {
                    if self.search_mode == SearchMode::FullText {
                        let _ = memory_fts::delete_memory_entry(pool, &block_id).await;
                    }
                }
            }
            changed = true;
        }

        if changed {
            persist_entries(&self.path, state.entries.values()).await?;
            if let Some(pool) = &self.pool {
                if self.search_mode == SearchMode::FullText {
                    for entry in state.entries.values() {
                        let _ = memory_fts::upsert_memory_entry(
                            pool,
                            &entry.block_id,
                            &entry.entry_type,
                            &entry.content,
                            &entry.tags,
                            entry.confidence,
                            entry.decay,
                            entry.round as i32,
                            entry.source_task_id,
                        )
                        .await;
                    }
                }
            }
        }

        Ok(stats)
    }

    /// Return the most-recently-updated entries, excluding canonical ids in
    /// `exclude_block_ids`, capped by `limit`.
    pub async fn recall(&self, exclude_block_ids: &[String], limit: usize) -> Vec<MemoryEntry> {
        let state = self.state.read().await;
        let mut entries: Vec<MemoryEntry> = state
            .entries
            .values()
            .filter(|e| !exclude_block_ids.contains(&e.block_id))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries.truncate(limit);
        entries
    }

    /// Full-text (or substring-fallback) search, scored by the composite
    /// formula: `0.45*text + 0.2*confidence + 0.15*recency +
    /// 0.1*recall_count_normalized + 0.1*feedback`. On FTS failure, falls
    /// back to substring matching without erroring (fail open).
    pub async fn search_relevant(&self, query: &str, limit: usize, exclude_block_ids: &[String]) -> Vec<ScoredEntry> {
        let tokens = tokenize(query);
        if tokens.is_empty() {
            return Vec::new();
        }

        let mut hits = if self.search_mode == SearchMode::FullText {
            match &self.pool {
                Some(pool) => match memory_fts::search_memory_entries(pool, query, (limit * 4) as i64).await {
                    Ok(rows) => rows
                        .into_iter()
                        .map(|hit| (hit.block_id.clone(), hit.score))
                        .collect::<HashMap<String, f64>>(),
                    Err(err) => {
                        tracing::warn!(error = %err, "full-text search failed, falling back to substring match");
                        HashMap::new()
                    }
                },
                None => HashMap::new(),
            }
        } else {
            HashMap::new()
        };

        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut scored: Vec<ScoredEntry> = state
            .entries
            .values()
            .filter(|e| !exclude_block_ids.contains(&e.block_id))
            .filter_map(|entry| {
                let text_score = hits.remove(&entry.block_id).unwrap_or_else(|| substring_score(entry, &tokens));
                if text_score <= 0.0 {
                    return None;
                }
                let age_days = (now - entry.updated_at).num_seconds() as f64 / 86_400.0;
                let recency = 1.0 / (1.0 + (age_days.max(0.0) / 30.0));
                let recall_count_normalized = (entry.recall_count as f64 / 10.0).min(1.0);
                let feedback = ((entry.feedback_score + 1.0) / 2.0).clamp(0.0, 1.0);
                let score = 0.45 * text_score
                    + 0.2 * entry.confidence
                    + 0.15 * recency
                    + 0.1 * recall_count_normalized
                    + 0.1 * feedback;
                Some(ScoredEntry { entry: entry.clone(), score })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entry.confidence.partial_cmp(&a.entry.confidence).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| b.entry.updated_at.cmp(&a.entry.updated_at))
        });
        scored.truncate(limit);

        for hit in &scored {
            if let Some(entry) = state.entries.get_mut(&hit.entry.block_id) {
                entry.recall_count = entry.recall_count.saturating_add(1);
            }
        }
        if !scored.is_empty() {
            let _ = persist_entries(&self.path, state.entries.values()).await;
        }

        scored
    }

    /// Apply a feedback signal to an entry's accumulated score, nudging it
    /// by `+-0.1` and clamping to `[-1.0, 1.0]`.
    pub async fn feedback(&self, block_id: &str, direction: FeedbackDirection) -> Result<()> {
        let canonical_id = canonicalize_block_id(block_id);
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(&canonical_id)
            .ok_or_else(|| anyhow::anyhow!("no memory entry for block id {canonical_id}"))?;
        let delta = match direction {
            FeedbackDirection::Positive => 0.1,
            FeedbackDirection::Negative => -0.1,
        };
        entry.feedback_score = (entry.feedback_score + delta).clamp(-1.0, 1.0);
        persist_entries(&self.path, state.entries.values()).await
    }

    pub async fn size(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn get(&self, block_id: &str) -> Option<MemoryEntry> {
        let canonical_id = canonicalize_block_id(block_id);
        self.state.read().await.entries.get(&canonical_id).cloned()
    }
}

/// Unicode letters/digits/`_`/`-` tokens of length >= 2, capped at 16.
fn tokenize(query: &str) -> Vec<String> {
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '-'))
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .take(16)
        .collect()
}

fn substring_score(entry: &MemoryEntry, tokens: &[String]) -> f64 {
    let haystack = format!("{} {}", entry.content, entry.tags.join(" ")).to_lowercase();
    let matched = tokens.iter().filter(|t| haystack.contains(t.as_str())).count();
    if tokens.is_empty() {
        0.0
    } else {
        matched as f64 / tokens.len() as f64
    }
}

async fn load_entries(path: &Path) -> Result<HashMap<String, MemoryEntry>> {
    let mut entries = HashMap::new();
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
        Err(e) => return Err(e).with_context(|| format!("failed to read memory store at {}", path.display())),
    };

    for (line_no, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<MemoryEntry>(line) {
            Ok(entry) => {
                entries.insert(entry.block_id.clone(), entry);
            }
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "skipping malformed memory store line");
            }
        }
    }
    Ok(entries)
}

async fn persist_entries<'a>(path: &Path, entries: impl Iterator<Item = &'a MemoryEntry>) -> Result<()> {
    let mut sorted: Vec<&MemoryEntry> = entries.collect();
    sorted.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let mut buf = String::new();
    for entry in sorted {
        buf.push_str(&serde_json::to_string(entry).context("failed to serialize memory entry")?);
        buf.push('\n');
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    tokio::fs::write(path, buf).await.with_context(|| format!("failed to write memory store at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(block_id: &str, content: &str, updated_at: DateTime<Utc>) -> MemoryEntry {
        MemoryEntry {
            block_id: block_id.to_string(),
            entry_type: "core".to_string(),
            content: content.to_string(),
            tags: vec![],
            confidence: 0.8,
            decay: 0.1,
            round: 1,
            source_task_id: None,
            created_at: updated_at,
            updated_at,
            recall_count: 0,
            feedback_score: 0.0,
        }
    }

    #[tokio::test]
    async fn upsert_skips_recall_like_types() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 10, SearchMode::Disabled, None).await.unwrap();

        let mut recall_entry = entry("core:x", "hello", Utc::now());
        recall_entry.entry_type = "persistent_recall".to_string();

        let stats = store.upsert(vec![recall_entry]).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(store.size().await, 0);
    }

    #[tokio::test]
    async fn upsert_canonicalizes_ids() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 10, SearchMode::Disabled, None).await.unwrap();

        store.upsert(vec![entry("persistent:core:x", "hello", Utc::now())]).await.unwrap();
        assert!(store.get("core:x").await.is_some());
        assert!(store.get("persistent:core:x").await.is_some());
    }

    #[tokio::test]
    async fn upsert_twice_identical_is_unchanged() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 10, SearchMode::Disabled, None).await.unwrap();

        let now = Utc::now();
        store.upsert(vec![entry("core:x", "hello", now)]).await.unwrap();
        let stats = store.upsert(vec![entry("core:x", "hello", now)]).await.unwrap();
        assert_eq!(stats, UpsertStats { inserted: 0, updated: 0, unchanged: 1, skipped: 0 });
    }

    #[tokio::test]
    async fn eviction_keeps_within_max_entries_breaking_ties_by_block_id() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 2, SearchMode::Disabled, None).await.unwrap();

        let same_time = Utc::now();
        store
            .upsert(vec![
                entry("b:z", "z", same_time),
                entry("a:a", "a", same_time),
                entry("c:c", "c", same_time),
            ])
            .await
            .unwrap();

        assert_eq!(store.size().await, 2);
        // "a:a" sorts first ascending, so it is evicted first on a tie.
        assert!(store.get("a:a").await.is_none());
        assert!(store.get("b:z").await.is_some());
        assert!(store.get("c:c").await.is_some());
    }

    #[tokio::test]
    async fn recall_excludes_ids_and_respects_limit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 10, SearchMode::Disabled, None).await.unwrap();

        store
            .upsert(vec![
                entry("core:a", "a", Utc::now()),
                entry("core:b", "b", Utc::now()),
            ])
            .await
            .unwrap();

        let recalled = store.recall(&["core:a".to_string()], 10).await;
        assert_eq!(recalled.len(), 1);
        assert_eq!(recalled[0].block_id, "core:b");
    }

    #[tokio::test]
    async fn reload_from_disk_recovers_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("memory.jsonl");
        {
            let store = MemoryStore::load(&path, 10, SearchMode::Disabled, None).await.unwrap();
            store.upsert(vec![entry("core:x", "hello", Utc::now())]).await.unwrap();
        }

        let reloaded = MemoryStore::load(&path, 10, SearchMode::Disabled, None).await.unwrap();
        assert!(reloaded.get("core:x").await.is_some());
    }

    #[tokio::test]
    async fn search_relevant_increments_recall_count() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 10, SearchMode::Disabled, None).await.unwrap();
        store.upsert(vec![entry("core:x", "widget assembly notes", Utc::now())]).await.unwrap();

        store.search_relevant("widget", 10, &[]).await;
        assert_eq!(store.get("core:x").await.unwrap().recall_count, 1);

        store.search_relevant("widget", 10, &[]).await;
        assert_eq!(store.get("core:x").await.unwrap().recall_count, 2);
    }

    #[tokio::test]
    async fn feedback_nudges_score_and_clamps() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 10, SearchMode::Disabled, None).await.unwrap();
        store.upsert(vec![entry("core:x", "hello", Utc::now())]).await.unwrap();

        for _ in 0..15 {
            store.feedback("core:x", FeedbackDirection::Positive).await.unwrap();
        }
        assert_eq!(store.get("core:x").await.unwrap().feedback_score, 1.0);

        store.feedback("core:x", FeedbackDirection::Negative).await.unwrap();
        assert!((store.get("core:x").await.unwrap().feedback_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn feedback_on_unknown_block_id_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = MemoryStore::load(tmp.path().join("memory.jsonl"), 10, SearchMode::Disabled, None).await.unwrap();
        assert!(store.feedback("core:missing", FeedbackDirection::Positive).await.is_err());
    }
}
