//! Durable schedule manager: one-shot delay/at triggers and recurring UTC
//! cron triggers, backed by the Postgres-persisted `scheduled_tasks` table.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use gateway_db::models::{ScheduleRow, TriggerMode, TriggerPayload};
use gateway_db::queries::schedules as schedule_db;

/// Timers never sleep longer than this in one hop; longer waits re-arm in
/// successive hops so a long-running process or clock jump cannot overflow
/// a single `tokio::time::sleep`.
const MAX_TIMER_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// A request to create a schedule, pre-validation.
#[derive(Debug, Clone)]
pub struct CreateScheduleRequest {
    pub dedupe_key: String,
    pub task_input: String,
    pub task_type: Option<String>,
    pub priority: Option<u8>,
    pub trigger: TriggerPayload,
}

/// Invoked when a schedule fires. Expected to submit a task via the
/// gateway's `submit_task` path; errors are logged and do not kill the
/// timer.
pub type OnTrigger = Arc<dyn Fn(ScheduleRow) -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync>;

struct ArmedSchedule {
    row: ScheduleRow,
    handle: JoinHandle<()>,
}

/// Owns the live timer for every schedule and persists state transitions
/// through `gateway-db`. Status is derived, never persisted: whether a
/// schedule is "active" is determined by its presence in this map.
pub struct ScheduleManager {
    pool: PgPool,
    on_trigger: OnTrigger,
    armed: Mutex<HashMap<Uuid, ArmedSchedule>>,
}

impl ScheduleManager {
    pub fn new(pool: PgPool, on_trigger: OnTrigger) -> Self {
        Self {
            pool,
            on_trigger,
            armed: Mutex::new(HashMap::new()),
        }
    }

    /// Replay the store on startup: normalize, drop invalid rows, and arm a
    /// timer for every surviving schedule (past-due ones fire immediately).
    pub async fn restart(self: &Arc<Self>) -> Result<()> {
        let now = Utc::now();
        let due = schedule_db::list_due_schedules(&self.pool, now)
            .await
            .context("failed to list due schedules for restart replay")?;
        if !due.is_empty() {
            tracing::info!(count = due.len(), "replaying schedules that fired while the process was down");
        }

        let rows = schedule_db::list_all_schedules(&self.pool)
            .await
            .context("failed to list schedules for restart replay")?;

        for row in rows {
            if row.trigger().is_err() {
                tracing::warn!(schedule_id = %row.schedule_id, "dropping schedule with unparseable trigger_json");
                continue;
            }
            self.arm(row).await;
        }
        Ok(())
    }

    /// Validate a trigger request, compute `next_run_at`, persist, and arm
    /// a timer for it.
    pub async fn create(self: &Arc<Self>, req: CreateScheduleRequest) -> Result<ScheduleRow> {
        if req.dedupe_key.trim().is_empty() {
            bail!("dedupe_key must not be empty");
        }
        if req.task_input.trim().is_empty() {
            bail!("task_input must not be empty");
        }
        if schedule_db::get_schedule_by_dedupe_key(&self.pool, &req.dedupe_key).await?.is_some() {
            bail!("dedupe_key {:?} is already in use", req.dedupe_key);
        }
        let priority = req.priority.unwrap_or(2);
        if priority > 4 {
            bail!("priority must be in 0..4, got {priority}");
        }

        let now = Utc::now();
        let (mode, next_run_at) = match &req.trigger {
            TriggerPayload::Delay { delay_seconds } => {
                if *delay_seconds <= 0.0 {
                    bail!("delay_seconds must be positive");
                }
                let millis = (*delay_seconds * 1000.0).round() as i64;
                (TriggerMode::Delay, now + chrono::Duration::milliseconds(millis))
            }
            TriggerPayload::At { run_at } => {
                if *run_at <= now {
                    bail!("run_at must be in the future");
                }
                (TriggerMode::At, *run_at)
            }
            TriggerPayload::Cron { expression, timezone } => {
                if timezone != "UTC" {
                    bail!("cron timezone must be \"UTC\", got {timezone:?}");
                }
                let next = next_cron_occurrence(expression, now)?;
                (TriggerMode::Cron, next)
            }
        };

        let trigger_json = serde_json::to_value(&req.trigger).context("failed to serialize trigger")?;
        let task_type = req.task_type.unwrap_or_else(|| "scheduled.input".to_string());

        let row = schedule_db::insert_schedule(
            &self.pool,
            &req.dedupe_key,
            &req.task_input,
            &task_type,
            priority as i16,
            mode,
            trigger_json,
            next_run_at,
        )
        .await?;

        self.arm(row.clone()).await;
        Ok(row)
    }

    /// Cancel a schedule. Returns whether one was actually removed.
    pub async fn cancel(&self, schedule_id: Uuid) -> Result<bool> {
        let mut armed = self.armed.lock().await;
        let Some(entry) = armed.remove(&schedule_id) else {
            return Ok(false);
        };
        entry.handle.abort();
        schedule_db::delete_schedule(&self.pool, schedule_id).await?;
        Ok(true)
    }

    /// List all schedules, sorted by `next_run_at` ascending.
    pub async fn list(&self) -> Result<Vec<ScheduleRow>> {
        schedule_db::list_all_schedules(&self.pool).await
    }

    /// Fetch a single schedule by id.
    pub async fn get(&self, schedule_id: Uuid) -> Result<Option<ScheduleRow>> {
        schedule_db::get_schedule(&self.pool, schedule_id).await
    }

    async fn arm(self: &Arc<Self>, row: ScheduleRow) {
        let schedule_id = row.schedule_id;
        let manager = Arc::clone(self);
        let row_for_task = row.clone();
        let handle = tokio::spawn(async move {
            manager.run_timer(row_for_task).await;
        });

        let mut armed = self.armed.lock().await;
        armed.insert(schedule_id, ArmedSchedule { row, handle });
    }

    /// Sleep (in `MAX_TIMER_DELAY`-bounded hops) until `next_run_at`, then
    /// fire. Re-arms itself for cron triggers; drops itself for one-shots.
    async fn run_timer(self: Arc<Self>, row: ScheduleRow) {
        loop {
            let now = Utc::now();
            let remaining = (row.next_run_at - now).to_std().unwrap_or(Duration::ZERO);
            if remaining > MAX_TIMER_DELAY {
                tokio::time::sleep(MAX_TIMER_DELAY).await;
                continue;
            }
            tokio::time::sleep(remaining).await;
            break;
        }

        if let Err(err) = (self.on_trigger)(row.clone()).await {
            tracing::error!(schedule_id = %row.schedule_id, error = %err, "schedule on_trigger failed");
        }

        match row.trigger_mode {
            TriggerMode::Cron => {
                let next = match row.trigger() {
                    Ok(TriggerPayload::Cron { expression, .. }) => {
                        next_cron_occurrence(&expression, Utc::now() + chrono::Duration::milliseconds(1))
                    }
                    _ => Err(anyhow::anyhow!("cron row lost its trigger payload")),
                };
                match next {
                    Ok(next_run_at) => {
                        if let Err(err) = schedule_db::reschedule(&self.pool, row.schedule_id, next_run_at).await {
                            tracing::error!(schedule_id = %row.schedule_id, error = %err, "failed to persist re-armed cron schedule");
                            return;
                        }
                        let mut updated = row;
                        updated.next_run_at = next_run_at;
                        self.arm(updated).await;
                    }
                    Err(err) => {
                        tracing::error!(schedule_id = %row.schedule_id, error = %err, "failed to compute next cron occurrence, dropping schedule");
                    }
                }
            }
            TriggerMode::Delay | TriggerMode::At => {
                if let Err(err) = schedule_db::delete_schedule(&self.pool, row.schedule_id).await {
                    tracing::error!(schedule_id = %row.schedule_id, error = %err, "failed to delete fired one-shot schedule");
                }
                self.armed.lock().await.remove(&row.schedule_id);
            }
        }
    }
}

/// Whether a cron string is the plain 5-field form this boundary accepts
/// (minute hour day-of-month month day-of-week), rather than the `cron`
/// crate's native 6-field form with a leading seconds field.
pub fn is_five_field_cron(expression: &str) -> bool {
    expression.split_whitespace().count() == 5
}

/// Compute the next UTC occurrence strictly after `after`. Bare 5-field
/// expressions (the boundary's accepted shape) are normalized to the
/// `cron` crate's 6-field grammar by prepending a `"0 "` seconds field.
fn next_cron_occurrence(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if !is_five_field_cron(expression) {
        bail!("cron expression must have exactly 5 fields, got {expression:?}");
    }
    let six_field = format!("0 {expression}");
    let schedule = CronSchedule::from_str(&six_field)
        .map_err(|e| anyhow::anyhow!("invalid cron expression {expression:?}: {e}"))?;
    schedule
        .after(&after)
        .next()
        .context("no future occurrences for cron expression")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_accepted() {
        assert!(is_five_field_cron("* * * * *"));
        assert!(!is_five_field_cron("0 * * * * *"));
    }

    #[test]
    fn next_occurrence_is_strictly_after_now() {
        let now = Utc::now();
        let next = next_cron_occurrence("* * * * *", now).unwrap();
        assert!(next > now);
    }

    #[test]
    fn invalid_cron_field_count_rejected() {
        let now = Utc::now();
        assert!(next_cron_occurrence("* * * *", now).is_err());
    }

    #[test]
    fn cron_minute_boundary_advances() {
        let now = Utc::now();
        let first = next_cron_occurrence("* * * * *", now).unwrap();
        let second = next_cron_occurrence("* * * * *", first).unwrap();
        assert!(second > first);
    }
}
