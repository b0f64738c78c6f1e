//! Database query functions for the optional full-text mirror of persistent
//! memory entries.
//!
//! The journal file in `gateway-core` is the source of truth; this table
//! only exists to let Postgres compute `tsvector`/`ts_rank` relevance scores
//! for search. Every function here is a no-op from the caller's point of
//! view if the FTS extension is disabled -- callers simply don't invoke
//! this module in that configuration.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use chrono::{DateTime, Utc};

use crate::models::MemoryEntryRow;

/// Insert or update the full-text mirror row for a memory entry.
///
/// `tsvector` generation is handled by the `content_tsv` generated column
/// declared in the migration, so callers never construct it themselves.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_memory_entry(
    pool: &PgPool,
    block_id: &str,
    entry_type: &str,
    content: &str,
    tags: &[String],
    confidence: f64,
    decay: f64,
    round: i32,
    source_task_id: Option<Uuid>,
) -> Result<MemoryEntryRow> {
    let row = sqlx::query_as::<_, MemoryEntryRow>(
        "INSERT INTO memory_entries \
            (block_id, entry_type, content, tags, confidence, decay, round, source_task_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         ON CONFLICT (block_id) DO UPDATE SET \
            entry_type = EXCLUDED.entry_type, \
            content = EXCLUDED.content, \
            tags = EXCLUDED.tags, \
            confidence = EXCLUDED.confidence, \
            decay = EXCLUDED.decay, \
            round = EXCLUDED.round, \
            source_task_id = EXCLUDED.source_task_id, \
            updated_at = NOW() \
         RETURNING block_id, entry_type, content, tags, confidence, decay, round, \
                   source_task_id, created_at, updated_at",
    )
    .bind(block_id)
    .bind(entry_type)
    .bind(content)
    .bind(tags)
    .bind(confidence)
    .bind(decay)
    .bind(round)
    .bind(source_task_id)
    .fetch_one(pool)
    .await
    .context("failed to upsert memory entry")?;

    Ok(row)
}

/// Delete the mirror row for a memory entry (e.g. after LRU eviction).
pub async fn delete_memory_entry(pool: &PgPool, block_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM memory_entries WHERE block_id = $1")
        .bind(block_id)
        .execute(pool)
        .await
        .context("failed to delete memory entry")?;

    Ok(result.rows_affected())
}

/// A search hit: a memory entry row plus its computed relevance score.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemorySearchHit {
    pub block_id: String,
    pub entry_type: String,
    pub content: String,
    pub tags: Vec<String>,
    pub confidence: f64,
    pub decay: f64,
    pub round: i32,
    pub source_task_id: Option<uuid::Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub score: f64,
}

impl MemorySearchHit {
    pub fn into_entry(self) -> MemoryEntryRow {
        MemoryEntryRow {
            block_id: self.block_id,
            entry_type: self.entry_type,
            content: self.content,
            tags: self.tags,
            confidence: self.confidence,
            decay: self.decay,
            round: self.round,
            source_task_id: self.source_task_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Full-text search over memory entries.
///
/// Combines `ts_rank` (textual relevance), `confidence`, and `decay` into a
/// single composite score: `ts_rank(content_tsv, query) * confidence *
/// (1.0 - decay)`. Ties are broken by the database's stable row order.
pub async fn search_memory_entries(
    pool: &PgPool,
    query: &str,
    limit: i64,
) -> Result<Vec<MemorySearchHit>> {
    let hits = sqlx::query_as::<_, MemorySearchHit>(
        "SELECT block_id, entry_type, content, tags, confidence, decay, round, \
                source_task_id, created_at, updated_at, \
                ts_rank(content_tsv, plainto_tsquery('english', $1)) * confidence * (1.0 - decay) AS score \
         FROM memory_entries \
         WHERE content_tsv @@ plainto_tsquery('english', $1) \
         ORDER BY score DESC \
         LIMIT $2",
    )
    .bind(query)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to search memory entries")?;

    Ok(hits)
}
