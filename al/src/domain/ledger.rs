//! Task ledger - ordered log of tool-step outcomes
//!
//! One step per dispatched tool call, opened before execution and closed by
//! the orchestrator. The quality gate scores failed and pending steps.

use serde::{Deserialize, Serialize};

/// Step lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Completed,
    Failed,
}

/// One ledger step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStep {
    pub id: u64,
    pub goal: String,
    pub capability: String,
    pub tool_name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Ordered step log for one run.
#[derive(Debug, Default)]
pub struct TaskLedger {
    steps: Vec<LedgerStep>,
    next_id: u64,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a step; returns its id.
    pub fn open(&mut self, goal: impl Into<String>, tool_name: impl Into<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let tool_name = tool_name.into();
        self.steps.push(LedgerStep {
            id,
            goal: goal.into(),
            capability: capability_of(&tool_name).to_string(),
            tool_name,
            status: StepStatus::Started,
            message: None,
        });
        id
    }

    /// Close a step as completed, optionally with a note.
    pub fn complete(&mut self, id: u64, message: Option<String>) {
        self.close(id, StepStatus::Completed, message);
    }

    /// Close a step as failed.
    pub fn fail(&mut self, id: u64, message: impl Into<String>) {
        self.close(id, StepStatus::Failed, Some(message.into()));
    }

    fn close(&mut self, id: u64, status: StepStatus, message: Option<String>) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == id) {
            step.status = status;
            step.message = message;
        }
    }

    pub fn steps(&self) -> &[LedgerStep] {
        &self.steps
    }

    pub fn failed_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed).count()
    }

    pub fn pending_count(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Started).count()
    }
}

/// Coarse capability class for a tool name, used in ledger goals and KPIs.
pub fn capability_of(tool_name: &str) -> &'static str {
    match tool_name {
        "fs_read" | "fs_write" | "fs_edit" | "fs_list" => "filesystem",
        "grep_search" | "glob_search" | "find_definition" | "code_stats" => "search",
        "shell_exec" => "shell",
        "archive_recall" => "memory",
        "spawn_agent" | "ask_parent" | "report" | "reflect_on_progress" => "agent",
        name if name.starts_with("todo_") => "planning",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_and_complete() {
        let mut ledger = TaskLedger::new();
        let id = ledger.open("read config", "fs_read");

        assert_eq!(ledger.pending_count(), 1);
        ledger.complete(id, None);

        assert_eq!(ledger.pending_count(), 0);
        assert_eq!(ledger.failed_count(), 0);
        assert_eq!(ledger.steps()[0].capability, "filesystem");
    }

    #[test]
    fn test_fail_records_message() {
        let mut ledger = TaskLedger::new();
        let id = ledger.open("run tests", "shell_exec");
        ledger.fail(id, "exit code 1");

        assert_eq!(ledger.failed_count(), 1);
        assert_eq!(ledger.steps()[0].message.as_deref(), Some("exit code 1"));
    }

    #[test]
    fn test_capability_mapping() {
        assert_eq!(capability_of("grep_search"), "search");
        assert_eq!(capability_of("todo_update"), "planning");
        assert_eq!(capability_of("spawn_agent"), "agent");
        assert_eq!(capability_of("mystery"), "other");
    }

    #[test]
    fn test_ids_are_ordered() {
        let mut ledger = TaskLedger::new();
        let a = ledger.open("a", "fs_read");
        let b = ledger.open("b", "fs_read");
        assert!(b > a);
    }
}
