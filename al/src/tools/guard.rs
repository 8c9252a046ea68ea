//! Tool guard - pre-dispatch assertions
//!
//! Guard rejections are invariant violations caught before a tool runs.
//! They are not tool errors: the ledger step closes as completed-with-note
//! and the model gets the rejection back as a hint.

use serde_json::Value;
use thiserror::Error;

use super::normalize::ReadWindowPlanner;
use crate::config::GuardConfig;

/// Path fragments that mark secondary build/backup artifacts.
const SECONDARY_ARTIFACT_MARKERS: &[&str] = &["/dist/", "/build/"];
const SECONDARY_ARTIFACT_SUFFIXES: &[&str] = &[".map", ".min.js", ".backup", ".bak", ".orig", ".tmp"];

/// A guard rejection. The hint goes back to the model verbatim.
#[derive(Debug, Error)]
pub enum GuardError {
    #[error("missing required parameter `{param}` for {tool}")]
    MissingParam { tool: String, param: &'static str },

    #[error("glob_search requires a non-empty pattern")]
    EmptyPattern,

    #[error("repeated small-window reads of {path} ({count} so far); read a larger window instead")]
    SmallWindowChurn { path: String, count: u32 },

    #[error("{path} is a build or backup artifact; read the primary source instead")]
    SecondaryArtifact { path: String },
}

impl GuardError {
    /// Hint text surfaced to the model.
    pub fn hint(&self) -> String {
        self.to_string()
    }
}

/// Pre-dispatch rule checker.
#[derive(Debug, Clone)]
pub struct ToolGuard {
    config: GuardConfig,
}

impl ToolGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self { config }
    }

    /// Assert all guard rules for one normalized call.
    pub fn check(
        &self,
        tool: &str,
        input: &Value,
        task_text: &str,
        planner: &ReadWindowPlanner,
    ) -> Result<(), GuardError> {
        self.check_required_params(tool, input)?;

        if tool == "glob_search" {
            let pattern = input.get("pattern").and_then(Value::as_str).unwrap_or_default();
            if pattern.trim().is_empty() {
                return Err(GuardError::EmptyPattern);
            }
        }

        if tool == "fs_read" {
            self.check_read_rules(input, task_text, planner)?;
        }

        Ok(())
    }

    fn check_required_params(&self, tool: &str, input: &Value) -> Result<(), GuardError> {
        let required: &[&'static str] = match tool {
            "fs_read" | "fs_list" => &["path"],
            "fs_write" => &["path", "content"],
            "fs_edit" => &["path"],
            "grep_search" | "glob_search" => &["pattern"],
            "find_definition" => &["symbol"],
            "shell_exec" => &["command"],
            "spawn_agent" => &["task"],
            "report" => &["summary"],
            "archive_recall" => &[],
            _ => &[],
        };

        for param in required {
            let present = match input.get(*param) {
                Some(Value::String(s)) => !s.trim().is_empty(),
                Some(Value::Null) | None => false,
                Some(_) => true,
            };
            if !present {
                return Err(GuardError::MissingParam {
                    tool: tool.to_string(),
                    param,
                });
            }
        }
        Ok(())
    }

    fn check_read_rules(&self, input: &Value, task_text: &str, planner: &ReadWindowPlanner) -> Result<(), GuardError> {
        let path = input.get("path").and_then(Value::as_str).unwrap_or_default();

        if is_secondary_artifact(path) && !task_mentions(task_text, path) {
            return Err(GuardError::SecondaryArtifact { path: path.to_string() });
        }

        if let Some(limit) = input.get("limit").and_then(Value::as_u64) {
            let count = planner.small_window_reads(path);
            if (limit as u32) < self.config.min_read_window_lines
                && count >= self.config.max_consecutive_small_window_reads_per_file
            {
                return Err(GuardError::SmallWindowChurn {
                    path: path.to_string(),
                    count,
                });
            }
        }
        Ok(())
    }

    /// True when a dispatched read counts as a small window.
    pub fn is_small_window(&self, input: &Value) -> bool {
        input
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| (l as u32) < self.config.min_read_window_lines)
            .unwrap_or(false)
    }
}

fn is_secondary_artifact(path: &str) -> bool {
    SECONDARY_ARTIFACT_MARKERS.iter().any(|m| path.contains(m))
        || SECONDARY_ARTIFACT_SUFFIXES.iter().any(|s| path.ends_with(s))
}

/// The task explicitly naming an artifact lifts the rejection.
fn task_mentions(task_text: &str, path: &str) -> bool {
    let task = task_text.to_lowercase();
    let path_lower = path.to_lowercase();
    if task.contains(&path_lower) {
        return true;
    }
    // Also accept a mention of the marker itself ("look in dist/", "the .map file")
    SECONDARY_ARTIFACT_SUFFIXES
        .iter()
        .any(|s| path_lower.ends_with(s) && task.contains(*s))
        || SECONDARY_ARTIFACT_MARKERS
            .iter()
            .any(|m| path_lower.contains(m) && task.contains(m.trim_matches('/')))
}
