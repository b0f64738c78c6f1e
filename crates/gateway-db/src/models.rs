use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The kind of trigger a persisted schedule row carries.
///
/// Stored as the `trigger_mode` column alongside a `trigger_json` payload
/// holding the variant-specific fields (see [`TriggerPayload`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Delay,
    At,
    Cron,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Delay => "delay",
            Self::At => "at",
            Self::Cron => "cron",
        };
        f.write_str(s)
    }
}

impl FromStr for TriggerMode {
    type Err = TriggerModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delay" => Ok(Self::Delay),
            "at" => Ok(Self::At),
            "cron" => Ok(Self::Cron),
            other => Err(TriggerModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TriggerMode`] string.
#[derive(Debug, Clone)]
pub struct TriggerModeParseError(pub String);

impl fmt::Display for TriggerModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid trigger mode: {:?}", self.0)
    }
}

impl std::error::Error for TriggerModeParseError {}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// The variant-specific trigger fields, serialized into the `trigger_json`
/// column. Kept separate from [`TriggerMode`] so the store can persist a
/// cron expression/timezone or a one-shot instant without extra columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerPayload {
    Delay { delay_seconds: f64 },
    At { run_at: DateTime<Utc> },
    Cron { expression: String, timezone: String },
}

/// A persisted schedule row, matching `scheduled_tasks` 1:1.
///
/// `FromRow` lets callers `fetch_as::<ScheduleRow>` directly; higher layers
/// (in `gateway-core`) convert this into the domain `Schedule` type after
/// parsing `trigger_json`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScheduleRow {
    pub schedule_id: uuid::Uuid,
    pub dedupe_key: String,
    pub task_input: String,
    pub task_type: String,
    pub priority: i16,
    pub trigger_mode: TriggerMode,
    pub trigger_json: serde_json::Value,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduleRow {
    /// Parse the stored `trigger_json` payload.
    ///
    /// Returns an error if the JSON does not match [`TriggerPayload`]'s
    /// shape for this row's `trigger_mode` -- this is the "unknown trigger
    /// mode" case the store's replay logic treats as an invalid row to skip
    /// with a warning rather than fail the whole load.
    pub fn trigger(&self) -> Result<TriggerPayload, serde_json::Error> {
        serde_json::from_value(self.trigger_json.clone())
    }
}

/// A persisted full-text mirror of a persistent memory entry.
///
/// Only populated when the memory coordinator's search mode is enabled;
/// the file-backed journal in `gateway-core` remains the source of truth,
/// this table exists purely to let Postgres compute `tsvector`/`ts_rank`
/// relevance scores `gateway-core` cannot cheaply compute itself.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MemoryEntryRow {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_mode_roundtrip() {
        for mode in [TriggerMode::Delay, TriggerMode::At, TriggerMode::Cron] {
            let s = mode.to_string();
            assert_eq!(TriggerMode::from_str(&s).unwrap(), mode);
        }
    }

    #[test]
    fn trigger_mode_rejects_unknown() {
        assert!(TriggerMode::from_str("weekly").is_err());
    }

    #[test]
    fn trigger_payload_serializes_tagged() {
        let payload = TriggerPayload::Cron {
            expression: "* * * * *".to_string(),
            timezone: "UTC".to_string(),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["kind"], "cron");
        assert_eq!(value["expression"], "* * * * *");
    }

    #[test]
    fn schedule_row_trigger_parses() {
        let row = ScheduleRow {
            schedule_id: uuid::Uuid::new_v4(),
            dedupe_key: "dedupe".to_string(),
            task_input: "do the thing".to_string(),
            task_type: "scheduled.input".to_string(),
            priority: 2,
            trigger_mode: TriggerMode::Delay,
            trigger_json: serde_json::json!({"kind": "delay", "delay_seconds": 30.0}),
            next_run_at: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        match row.trigger().unwrap() {
            TriggerPayload::Delay { delay_seconds } => assert_eq!(delay_seconds, 30.0),
            other => panic!("unexpected trigger payload: {other:?}"),
        }
    }
}
