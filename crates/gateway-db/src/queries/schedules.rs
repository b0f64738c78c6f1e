//! Database query functions for the `scheduled_tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ScheduleRow, TriggerMode};

/// Insert a new schedule row.
///
/// `dedupe_key` carries a unique constraint at the database level; a
/// conflicting insert is surfaced as an error rather than silently
/// swallowed, since schedule creation reports duplicates to the caller.
#[allow(clippy::too_many_arguments)]
pub async fn insert_schedule(
    pool: &PgPool,
    dedupe_key: &str,
    task_input: &str,
    task_type: &str,
    priority: i16,
    trigger_mode: TriggerMode,
    trigger_json: serde_json::Value,
    next_run_at: DateTime<Utc>,
) -> Result<ScheduleRow> {
    let row = sqlx::query_as::<_, ScheduleRow>(
        "INSERT INTO scheduled_tasks \
            (dedupe_key, task_input, task_type, priority, trigger_mode, trigger_json, next_run_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(dedupe_key)
    .bind(task_input)
    .bind(task_type)
    .bind(priority)
    .bind(trigger_mode)
    .bind(trigger_json)
    .bind(next_run_at)
    .fetch_one(pool)
    .await
    .context("failed to insert schedule")?;

    Ok(row)
}

/// Fetch a single schedule by ID.
pub async fn get_schedule(pool: &PgPool, schedule_id: Uuid) -> Result<Option<ScheduleRow>> {
    let row = sqlx::query_as::<_, ScheduleRow>("SELECT * FROM scheduled_tasks WHERE schedule_id = $1")
        .bind(schedule_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch schedule")?;

    Ok(row)
}

/// Fetch a schedule by its dedupe key.
pub async fn get_schedule_by_dedupe_key(
    pool: &PgPool,
    dedupe_key: &str,
) -> Result<Option<ScheduleRow>> {
    let row = sqlx::query_as::<_, ScheduleRow>(
        "SELECT * FROM scheduled_tasks WHERE dedupe_key = $1",
    )
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch schedule by dedupe key")?;

    Ok(row)
}

/// List every schedule, ordered by next occurrence. Used on startup to
/// reload and re-arm the in-process timer for each row.
pub async fn list_all_schedules(pool: &PgPool) -> Result<Vec<ScheduleRow>> {
    let rows = sqlx::query_as::<_, ScheduleRow>(
        "SELECT * FROM scheduled_tasks ORDER BY next_run_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list schedules")?;

    Ok(rows)
}

/// Advance a schedule's `next_run_at` after it fires. Cron triggers call
/// this with the newly computed next occurrence; one-shot triggers instead
/// call [`delete_schedule`].
pub async fn reschedule(pool: &PgPool, schedule_id: Uuid, next_run_at: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE scheduled_tasks SET next_run_at = $1, updated_at = NOW() WHERE schedule_id = $2",
    )
    .bind(next_run_at)
    .bind(schedule_id)
    .execute(pool)
    .await
    .context("failed to reschedule")?;

    Ok(result.rows_affected())
}

/// Delete a schedule. Called after a one-shot (`delay`/`at`) trigger fires,
/// or when a schedule is cancelled.
pub async fn delete_schedule(pool: &PgPool, schedule_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM scheduled_tasks WHERE schedule_id = $1")
        .bind(schedule_id)
        .execute(pool)
        .await
        .context("failed to delete schedule")?;

    Ok(result.rows_affected())
}

/// Fetch every schedule whose `next_run_at` has already elapsed.
///
/// Used on startup to replay triggers that fired while the process was
/// down, per the durable-schedule restart-replay requirement.
pub async fn list_due_schedules(pool: &PgPool, as_of: DateTime<Utc>) -> Result<Vec<ScheduleRow>> {
    let rows = sqlx::query_as::<_, ScheduleRow>(
        "SELECT * FROM scheduled_tasks WHERE next_run_at <= $1 ORDER BY next_run_at ASC",
    )
    .bind(as_of)
    .fetch_all(pool)
    .await
    .context("failed to list due schedules")?;

    Ok(rows)
}
