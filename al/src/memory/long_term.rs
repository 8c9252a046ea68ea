//! Pluggable long-term memory
//!
//! Distinct from the run's two-tier working memory: this is the optional
//! cross-session store an embedder may provide. The engine only consults it
//! when building the system prompt and records one entry per completed run.

use async_trait::async_trait;

/// Optional long-term memory collaborator.
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    /// Record a durable entry for the session.
    async fn add(&self, session_id: &str, entry: &str) -> eyre::Result<()>;

    /// Most recent entries, newest last.
    async fn recent(&self, session_id: &str, limit: usize) -> eyre::Result<Vec<String>>;

    /// Rendered context block relevant to `task`, or empty.
    async fn context(&self, session_id: &str, task: &str) -> eyre::Result<String>;
}
