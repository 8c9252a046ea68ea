//! ToolContext - execution context and capabilities for tools
//!
//! The context carries back-references the registry's tools need (the run's
//! archive for `archive_recall`, the spawner for `spawn_agent`) as injected
//! capabilities rather than owning references; their lifetime is the run.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::TaskResult;
use crate::memory::Archive;

/// Capability to spawn a sub-agent. Main agents only; children never
/// receive one.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, task: &str, working_dir: PathBuf) -> eyre::Result<TaskResult>;
}

/// Kind of file touch forwarded to the file-change subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChange {
    Read,
    Modified,
    Created,
}

/// Narrow seam to the external file-change history / conflict detection
/// subsystem. The engine only forwards identity plus the touched path.
pub trait FileChangeTracker: Send + Sync {
    fn on_file_event(&self, agent_id: &str, session_id: &str, path: &str, change: FileChange);
}

/// Execution context for tools - scoped to a single run.
#[derive(Clone)]
pub struct ToolContext {
    /// Scope root - all file ops are interpreted against this.
    pub working_dir: PathBuf,

    pub session_id: String,

    pub agent_id: String,

    /// The run's cold memory, readable by `archive_recall`.
    pub archive: Arc<Mutex<Archive>>,

    /// Present on main agents only.
    pub spawner: Option<Arc<dyn AgentSpawner>>,

    /// Optional file-change subsystem seam.
    pub file_changes: Option<Arc<dyn FileChangeTracker>>,
}

impl ToolContext {
    pub fn new(
        working_dir: PathBuf,
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        archive: Arc<Mutex<Archive>>,
    ) -> Self {
        Self {
            working_dir,
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            archive,
            spawner: None,
            file_changes: None,
        }
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn AgentSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_file_changes(mut self, tracker: Arc<dyn FileChangeTracker>) -> Self {
        self.file_changes = Some(tracker);
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("working_dir", &self.working_dir)
            .field("session_id", &self.session_id)
            .field("agent_id", &self.agent_id)
            .field("has_spawner", &self.spawner.is_some())
            .finish()
    }
}
