//! Progressive conversation history
//!
//! The engine never replays a whole session verbatim. History is served in
//! three bounded tiers: the most recent exchanges in full, a mid-term band
//! condensed to one line each, and everything older collapsed to ultra-brief
//! stubs. The engine consumes the tiers in order and never re-summarizes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stored conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// "user" or "assistant"
    pub role: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            at: Utc::now(),
        }
    }
}

/// Tier sizing for progressive summarization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPolicy {
    /// Records served verbatim.
    pub recent_limit: usize,
    /// Records behind the recent band, condensed to one line each.
    pub mid_term_limit: usize,
    /// Maximum ultra-brief stubs for everything older.
    pub old_limit: usize,
    /// Character cap for a mid-term line.
    pub mid_term_chars: usize,
    /// Character cap for an old stub.
    pub old_chars: usize,
}

impl Default for HistoryPolicy {
    fn default() -> Self {
        Self {
            recent_limit: 8,
            mid_term_limit: 12,
            old_limit: 20,
            mid_term_chars: 160,
            old_chars: 60,
        }
    }
}

/// History split into the three tiers the engine consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SummarizedHistory {
    pub recent: Vec<ConversationRecord>,
    pub mid_term: Vec<String>,
    pub old: Vec<String>,
}

impl SummarizedHistory {
    pub fn is_empty(&self) -> bool {
        self.recent.is_empty() && self.mid_term.is_empty() && self.old.is_empty()
    }
}

/// Split `records` (chronological) into tiers per `policy`.
pub fn summarize_history(records: &[ConversationRecord], policy: &HistoryPolicy) -> SummarizedHistory {
    let total = records.len();
    let recent_start = total.saturating_sub(policy.recent_limit);
    let mid_start = recent_start.saturating_sub(policy.mid_term_limit);

    let recent = records[recent_start..].to_vec();

    let mid_term = records[mid_start..recent_start]
        .iter()
        .map(|r| condense(r, policy.mid_term_chars))
        .collect();

    // Oldest records collapse hardest; when over the cap, keep the most
    // recent of them (the tail of the old band).
    let old_band = &records[..mid_start];
    let old_start = old_band.len().saturating_sub(policy.old_limit);
    let old = old_band[old_start..]
        .iter()
        .map(|r| condense(r, policy.old_chars))
        .collect();

    SummarizedHistory { recent, mid_term, old }
}

fn condense(record: &ConversationRecord, max_chars: usize) -> String {
    let flat: String = record
        .content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let clipped: String = flat.chars().take(max_chars).collect();
    let ellipsis = if flat.chars().count() > max_chars { "…" } else { "" };
    format!("[{}] {}{}", record.role, clipped, ellipsis)
}
