//! Run specification and result types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::id;
use crate::events::TraceEvent;
use crate::llm::Tier;

/// Everything needed to start a run. Immutable after construction except
/// for one scope-narrowing replacement of `working_dir` before the loop.
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Unique per run.
    pub agent_id: String,
    /// Set for sub-agents only.
    pub parent_agent_id: Option<String>,
    pub session_id: String,
    pub working_dir: PathBuf,
    pub task: String,
    /// Starting tier for the main loop.
    pub tier: Tier,
}

impl RunSpec {
    pub fn new(session_id: impl Into<String>, working_dir: impl Into<PathBuf>, task: impl Into<String>) -> Self {
        let task = task.into();
        Self {
            agent_id: id::agent_id(&task),
            parent_agent_id: None,
            session_id: session_id.into(),
            working_dir: working_dir.into(),
            task,
            tier: Tier::Small,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Derive a child spec for a spawned sub-agent.
    pub fn child(&self, task: impl Into<String>, working_dir: PathBuf) -> Self {
        let task = task.into();
        Self {
            agent_id: id::agent_id(&task),
            parent_agent_id: Some(self.agent_id.clone()),
            session_id: self.session_id.clone(),
            working_dir,
            task,
            tier: self.tier,
        }
    }

    /// True for top-level agents (scope narrowing, spawn capability).
    pub fn is_main(&self) -> bool {
        self.parent_agent_id.is_none()
    }
}

/// Inferred task intent, from the one-shot classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Action,
    Discovery,
    Analysis,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Action => "action",
            Intent::Discovery => "discovery",
            Intent::Analysis => "analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "action" => Some(Intent::Action),
            "discovery" => Some(Intent::Discovery),
            "analysis" => Some(Intent::Analysis),
            _ => None,
        }
    }
}

/// Final outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    pub success: bool,
    pub summary: String,
    pub files_created: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_read: Vec<String>,
    pub iterations: u32,
    pub tokens_used: u64,
    pub trace: Vec<TraceEvent>,
    pub error: Option<String>,
}

impl TaskResult {
    /// Failure result with a terminal error code and summary.
    pub fn failure(error: impl Into<String>, summary: impl Into<String>, iterations: u32) -> Self {
        Self {
            success: false,
            summary: summary.into(),
            iterations,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_spec_child_links_parent() {
        let parent = RunSpec::new("s1", "/tmp/work", "parent task").with_tier(Tier::Medium);
        let child = parent.child("child task", PathBuf::from("/tmp/work/sub"));

        assert_eq!(child.parent_agent_id.as_deref(), Some(parent.agent_id.as_str()));
        assert_eq!(child.session_id, "s1");
        assert_eq!(child.tier, Tier::Medium);
        assert!(parent.is_main());
        assert!(!child.is_main());
        assert_ne!(child.agent_id, parent.agent_id);
    }

    #[test]
    fn test_intent_parse() {
        assert_eq!(Intent::parse("discovery"), Some(Intent::Discovery));
        assert_eq!(Intent::parse("unknown"), None);
    }

    #[test]
    fn test_failure_result() {
        let result = TaskResult::failure("loop_detected", "The agent kept repeating actions", 3);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("loop_detected"));
        assert_eq!(result.iterations, 3);
    }
}
