//! Task types: status, controlled-stop reasons, and the task record itself.

pub mod queue;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use queue::{AttemptHook, TaskQueue};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

/// The closed set of controlled-stop reasons a driver may signal.
///
/// Any other driver failure is treated as a regular (retryable) error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ToolBudgetExhausted,
    StepLimitSegmentContinue,
    ModelStepBudgetExhausted,
    ContinuationLimitReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ToolBudgetExhausted => "tool_budget_exhausted",
            Self::StepLimitSegmentContinue => "step_limit_segment_continue",
            Self::ModelStepBudgetExhausted => "model_step_budget_exhausted",
            Self::ContinuationLimitReached => "continuation_limit_reached",
        };
        f.write_str(s)
    }
}

impl FromStr for StopReason {
    type Err = StopReasonParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_budget_exhausted" => Ok(Self::ToolBudgetExhausted),
            "step_limit_segment_continue" => Ok(Self::StepLimitSegmentContinue),
            "model_step_budget_exhausted" => Ok(Self::ModelStepBudgetExhausted),
            "continuation_limit_reached" => Ok(Self::ContinuationLimitReached),
            other => Err(StopReasonParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StopReasonParseError(pub String);

impl fmt::Display for StopReasonParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid stop reason: {:?}", self.0)
    }
}

impl std::error::Error for StopReasonParseError {}

/// An error recorded on a terminal task, distinct from the executor's
/// [`crate::error::TaskError`] which only lives for the duration of one
/// attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub message: String,
    pub stack: Option<String>,
}

/// A task tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub priority: u8,
    pub status: TaskStatus,
    pub input: String,
    pub result: Option<String>,
    pub error: Option<TaskErrorInfo>,
    pub retries: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub cancellable: bool,
}

/// Default task type tag when none is supplied.
pub const DEFAULT_TASK_TYPE: &str = "http.input";

/// Default priority (0..4, lower is more urgent).
pub const DEFAULT_PRIORITY: u8 = 2;

/// Default retry budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

impl Task {
    /// Build a new pending task with defaulted fields, per the
    /// `CreateTaskRequest` contract.
    pub fn new(task_type: Option<String>, input: String, priority: Option<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string()),
            priority: priority.unwrap_or(DEFAULT_PRIORITY),
            status: TaskStatus::Pending,
            input,
            result: None,
            error: None,
            retries: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            created_at: now,
            started_at: None,
            finished_at: None,
            parent_id: None,
            metadata: HashMap::new(),
            cancellable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Success,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(&status.to_string()).unwrap(), status);
        }
    }

    #[test]
    fn stop_reason_roundtrip() {
        for reason in [
            StopReason::ToolBudgetExhausted,
            StopReason::StepLimitSegmentContinue,
            StopReason::ModelStepBudgetExhausted,
            StopReason::ContinuationLimitReached,
        ] {
            assert_eq!(StopReason::from_str(&reason.to_string()).unwrap(), reason);
        }
    }

    #[test]
    fn new_task_has_defaults() {
        let task = Task::new(None, "hello".to_string(), None);
        assert_eq!(task.task_type, DEFAULT_TASK_TYPE);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
    }
}
