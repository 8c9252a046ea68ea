//! SessionStore - session persistence for agentloop
//!
//! Stores everything that outlives a single agent run:
//! - Conversation history, served back progressively summarized
//!   (recent verbatim, mid-term condensed, old ultra-brief)
//! - KPI baselines (EMAs + bounded sample histories) used for token
//!   budgeting and regression detection
//! - A session event log (JSONL) for post-hoc inspection
//!
//! # Layout
//!
//! ```text
//! .kb/memory/
//! └── {session_id}/
//!     ├── baseline.json    # KPI baseline (advisory-locked read-modify-write)
//!     ├── history.jsonl    # conversation records, append-only
//!     ├── events.jsonl     # session events, append-only
//!     └── artifacts.md     # optional trace artifacts context
//! ```
//!
//! Baseline updates are read-modify-write with last-writer-wins semantics.
//! Baselines are advisory, so a lost update is acceptable; the fs2 lock only
//! prevents torn writes within one update.

mod history;
mod kpi;
mod store;

pub use history::{ConversationRecord, HistoryPolicy, SummarizedHistory, summarize_history};
pub use kpi::{EMA_ALPHA, HISTORY_LIMIT, KpiBaseline, KpiSample};
pub use store::{
    EventFilter, FileSessionStore, MemorySessionStore, SessionEvent, SessionStore,
};

use std::path::{Path, PathBuf};

/// Default on-disk location of session memory, relative to a scope root.
pub fn default_memory_dir(scope_root: impl AsRef<Path>) -> PathBuf {
    scope_root.as_ref().join(".kb").join("memory")
}
