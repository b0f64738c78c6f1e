//! Persistent memory subsystem: canonicalized keyed block store, an
//! optional Postgres full-text mirror, a write-ahead capture-queue journal,
//! and the coordinator that wires recall/capture into task execution.

pub mod capture_queue;
pub mod coordinator;
pub mod store;

pub use capture_queue::{CaptureJob, CaptureQueue};
pub use coordinator::{CoordinatorConfig, MemoryCoordinator, PipelineMode, RecallBlock};
pub use store::{FeedbackDirection, MemoryEntry, MemoryStore, ScoredEntry, SearchMode, UpsertStats};

/// Recall-like entry types are refused on capture -- they exist only as the
/// coordinator's own output, not as capturable state.
pub const RECALL_LIKE_TYPES: &[&str] = &["persistent_recall", "persistent_longterm_recall"];

/// Canonicalize a memory block id: trim, strip repeated leading
/// `persistent:` prefixes, and collapse repeated `working:` prefixes to a
/// single one. Idempotent: `canon(canon(x)) == canon(x)`.
pub fn canonicalize_block_id(raw: &str) -> String {
    let mut id = raw.trim().to_string();
    while let Some(stripped) = id.strip_prefix("persistent:") {
        id = stripped.trim().to_string();
    }
    let mut working_count = 0;
    let mut rest = id.as_str();
    while let Some(stripped) = rest.strip_prefix("working:") {
        working_count += 1;
        rest = stripped.trim_start();
    }
    if working_count > 0 {
        id = format!("working:{rest}");
    }
    id
}
