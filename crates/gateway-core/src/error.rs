//! Shared typed errors for the queue executor and task lifecycle.

use crate::task::StopReason;

/// The result of a single executor attempt, as seen by the queue.
///
/// Distinguishes retryable failures from terminal ones so the queue can
/// decide whether to requeue, fail, or cancel without inspecting message
/// text.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error(transparent)]
    Retryable(#[from] anyhow::Error),

    #[error("controlled stop: {0}")]
    ControlledStop(StopReason),

    #[error("task aborted")]
    Abort,
}

impl TaskError {
    /// Whether the queue should requeue this attempt (subject to
    /// `retries < max_retries`).
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Retryable(_))
    }

    /// Whether this error represents an abort/cancel rather than an
    /// ordinary failure, per the abort-like message-shape convention.
    pub fn is_abort(&self) -> bool {
        match self {
            TaskError::Abort => true,
            TaskError::Retryable(err) => is_abort_like_message(&err.to_string()),
            TaskError::ControlledStop(_) => false,
        }
    }

    /// Whether this error matches the context-overflow pattern that
    /// triggers a queue purge.
    pub fn is_context_overflow(&self) -> bool {
        match self {
            TaskError::Retryable(err) => is_context_overflow_message(&err.to_string()),
            _ => false,
        }
    }
}

/// Messages that identify an abort/cancel rather than an ordinary failure.
/// Matched case-insensitively, mirroring the driver's own abort signaling.
pub fn is_abort_like_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("aborted") || lower.contains("force_abort") || lower.contains("force abort")
}

/// The context-overflow trigger: `/maximum context length/i`.
pub fn is_context_overflow_message(message: &str) -> bool {
    message.to_lowercase().contains("maximum context length")
}
