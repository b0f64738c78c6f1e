//! Per-task append-only message buffer with step renumbering across agent
//! driver segment restarts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

/// The category/type discriminator for a task message, modeled as a tagged
/// enum over `{category, type}` pairs rather than stringly-typed dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum TaskMessageBody {
    Other(OtherMessage),
    Assistant { text: String, r#final: bool },
    Tool(ToolMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OtherMessage {
    Status { text: String },
    Error { text: String },
    Finish { finish_reason: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolMessage {
    Call {
        tool_name: String,
        tool_call_id: Option<String>,
        input_summary: String,
        display_payload: Option<serde_json::Value>,
        step: Option<u64>,
    },
    Result {
        tool_name: String,
        tool_call_id: Option<String>,
        output_summary: String,
        display_payload: Option<serde_json::Value>,
        step: Option<u64>,
        ok: bool,
        error_message: Option<String>,
    },
}

/// A caller-supplied message draft, before `seq`/`created_at`/normalized
/// `step` are assigned by the buffer.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub body: TaskMessageBody,
    pub created_at: Option<DateTime<Utc>>,
    /// Raw step as reported by the agent driver, before normalization.
    /// `None` for `other.*` messages that carry no step.
    pub raw_step: Option<u64>,
}

/// A stored message: the draft plus the buffer-assigned `seq` and
/// normalized `step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub step: Option<u64>,
    pub body: TaskMessageBody,
}

/// The result of a `delta(after_seq)` query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDelta {
    pub items: Vec<TaskMessage>,
    pub latest_seq: u64,
    pub next_seq: u64,
}

#[derive(Default)]
struct BufferState {
    messages: Vec<TaskMessage>,
    /// Sum of completed segment lengths, added to each new segment's raw
    /// step to produce a globally monotonic normalized step.
    step_base: u64,
    /// The highest raw step seen so far in the current segment, from either
    /// a tool message or a `finish`. A later raw step lower than this marks
    /// a segment restart.
    last_raw_step: u64,
}

/// Append-only per-task message log, keyed by task id.
pub struct MessageBuffer {
    buffers: Mutex<HashMap<Uuid, BufferState>>,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Append a draft to a task's buffer, assigning `seq` and normalizing
    /// `step` per the segment-restart renumbering rule.
    pub async fn append(&self, task_id: Uuid, draft: MessageDraft) -> TaskMessage {
        let mut buffers = self.buffers.lock().await;
        let state = buffers.entry(task_id).or_default();

        let step = normalize_step(state, &draft);

        let message = TaskMessage {
            seq: state.messages.len() as u64 + 1,
            created_at: draft.created_at.unwrap_or_else(Utc::now),
            step,
            body: draft.body,
        };
        state.messages.push(message.clone());
        message
    }

    /// Return every message with `seq > after_seq`, plus the current
    /// `latest_seq`/`next_seq`. `after_seq` larger than `latest_seq` yields
    /// an empty `items` with the unchanged `latest_seq`.
    pub async fn delta(&self, task_id: Uuid, after_seq: u64) -> MessageDelta {
        let buffers = self.buffers.lock().await;
        let Some(state) = buffers.get(&task_id) else {
            return MessageDelta {
                items: Vec::new(),
                latest_seq: 0,
                next_seq: 1,
            };
        };
        let latest_seq = state.messages.len() as u64;
        let items = state
            .messages
            .iter()
            .filter(|m| m.seq > after_seq)
            .cloned()
            .collect();
        MessageDelta {
            items,
            latest_seq,
            next_seq: latest_seq + 1,
        }
    }
}

/// Normalize the raw step on a draft into the globally monotonic step for
/// its task, per §4.2's segment-restart rule. A segment restart is detected
/// on *any* message carrying an explicit raw step -- not only `finish` --
/// since a tool call can arrive right after a restart but before the next
/// `finish`. Drivers that violate the "finish always carries a positive
/// integer" assumption pass through unmodified with a warning, rather than
/// triggering a (wrong) renumbering event.
fn normalize_step(state: &mut BufferState, draft: &MessageDraft) -> Option<u64> {
    match &draft.body {
        TaskMessageBody::Tool(_) => match draft.raw_step {
            Some(raw) => Some(apply_raw_step(state, raw)),
            None => Some(state.step_base + state.last_raw_step + 1),
        },
        TaskMessageBody::Other(OtherMessage::Finish { .. }) => {
            let Some(raw) = draft.raw_step else {
                return None;
            };
            if raw == 0 {
                tracing::warn!(raw_step = raw, "non-positive step.finish, passing through unmodified");
                return Some(raw);
            }
            Some(apply_raw_step(state, raw))
        }
        _ => draft.raw_step,
    }
}

/// Fold one raw step, carried by a tool message or a `finish`, into the
/// buffer's running offset. A raw step lower than the highest one seen so
/// far in the current segment means the driver restarted a new segment, so
/// the offset absorbs everything seen in the old one before the new raw
/// step is added on top.
fn apply_raw_step(state: &mut BufferState, raw: u64) -> u64 {
    if raw < state.last_raw_step {
        state.step_base += state.last_raw_step;
    }
    state.last_raw_step = raw;
    state.step_base + raw
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_draft(text: &str) -> MessageDraft {
        MessageDraft {
            body: TaskMessageBody::Other(OtherMessage::Status { text: text.to_string() }),
            created_at: None,
            raw_step: None,
        }
    }

    fn tool_call_draft(step: Option<u64>) -> MessageDraft {
        MessageDraft {
            body: TaskMessageBody::Tool(ToolMessage::Call {
                tool_name: "shell".to_string(),
                tool_call_id: None,
                input_summary: "ls".to_string(),
                display_payload: None,
                step,
            }),
            created_at: None,
            raw_step: step,
        }
    }

    fn finish_draft(raw_step: u64) -> MessageDraft {
        MessageDraft {
            body: TaskMessageBody::Other(OtherMessage::Finish { finish_reason: None }),
            created_at: None,
            raw_step: Some(raw_step),
        }
    }

    #[tokio::test]
    async fn seq_is_dense_and_ordered() {
        let buffer = MessageBuffer::new();
        let task_id = Uuid::new_v4();
        buffer.append(task_id, status_draft("queued")).await;
        buffer.append(task_id, status_draft("running")).await;
        buffer.append(task_id, status_draft("done")).await;

        let delta = buffer.delta(task_id, 0).await;
        let seqs: Vec<u64> = delta.items.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(delta.latest_seq, 3);
        assert_eq!(delta.next_seq, 4);
    }

    #[tokio::test]
    async fn delta_after_latest_is_empty() {
        let buffer = MessageBuffer::new();
        let task_id = Uuid::new_v4();
        buffer.append(task_id, status_draft("queued")).await;

        let delta = buffer.delta(task_id, 1).await;
        assert!(delta.items.is_empty());
        assert_eq!(delta.latest_seq, 1);
        assert_eq!(delta.next_seq, 2);
    }

    #[tokio::test]
    async fn step_renumbers_monotonically_across_segment_restart() {
        let buffer = MessageBuffer::new();
        let task_id = Uuid::new_v4();

        let m1 = buffer.append(task_id, tool_call_draft(Some(1))).await;
        let m2 = buffer.append(task_id, finish_draft(3)).await;
        // Segment restarts: raw step drops back to 1.
        let m3 = buffer.append(task_id, tool_call_draft(Some(1))).await;
        let m4 = buffer.append(task_id, finish_draft(2)).await;

        assert_eq!(m1.step, Some(1));
        assert_eq!(m2.step, Some(3));
        assert_eq!(m3.step, Some(4)); // step_base (3) + raw (1)
        assert_eq!(m4.step, Some(5)); // step_base (3) + raw (2)

        let steps: Vec<_> = [m1, m2, m3, m4].iter().map(|m| m.step.unwrap()).collect();
        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn tool_message_without_step_derives_from_last_completed() {
        let buffer = MessageBuffer::new();
        let task_id = Uuid::new_v4();

        buffer.append(task_id, finish_draft(5)).await;
        let derived = buffer.append(task_id, tool_call_draft(None)).await;
        assert_eq!(derived.step, Some(6));
    }

    #[tokio::test]
    async fn garbled_finish_step_passes_through_unmodified() {
        let buffer = MessageBuffer::new();
        let task_id = Uuid::new_v4();
        let m = buffer.append(task_id, finish_draft(0)).await;
        assert_eq!(m.step, Some(0));
    }
}
