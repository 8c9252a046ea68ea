//! Tool input normalization
//!
//! Canonicalizes tool arguments before guard checks and dispatch. All rules
//! are pure given the planner state, so normalizing twice is the same as
//! normalizing once; attempt counters advance only when the engine records
//! a dispatch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::llm::Tier;

/// Tools whose results feed the search-signal tracker.
pub const SEARCH_TOOLS: &[&str] = &["grep_search", "glob_search", "find_definition"];

/// Broad discovery tools removed under cost-aware restriction.
pub const BROAD_DISCOVERY_TOOLS: &[&str] = &["glob_search", "grep_search", "fs_list", "find_definition", "code_stats"];

/// Tools that take a `directory` argument worth canonicalizing.
const DIRECTORY_TOOLS: &[&str] = &["grep_search", "glob_search", "find_definition", "code_stats"];

/// Backup-ish suffixes mapped back to the primary file.
const BACKUP_SUFFIXES: &[&str] = &[".backup", ".bak", ".orig", ".tmp"];

/// Hard cap on any read window.
const MAX_READ_WINDOW: u32 = 1000;

/// Window cap for reads near the end of a file.
const NEAR_TAIL_WINDOW: u32 = 400;

/// Read-window state for one run: attempts per path, learned file sizes.
///
/// The planner is read-only during normalization; the engine records
/// attempts after dispatch. That split keeps normalization idempotent.
#[derive(Debug, Default)]
pub struct ReadWindowPlanner {
    attempts: HashMap<String, u32>,
    small_windows: HashMap<String, u32>,
    known_total_lines: HashMap<String, u32>,
}

impl ReadWindowPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one dispatched read of `path`.
    pub fn record_attempt(&mut self, path: &str) {
        *self.attempts.entry(path.to_string()).or_default() += 1;
    }

    /// Record a small-window read of `path` (guard bookkeeping).
    pub fn record_small_window(&mut self, path: &str) {
        *self.small_windows.entry(path.to_string()).or_default() += 1;
    }

    /// Remember a file's total line count once a tool reported it.
    pub fn learn_total_lines(&mut self, path: &str, lines: u32) {
        self.known_total_lines.insert(path.to_string(), lines);
    }

    pub fn attempts(&self, path: &str) -> u32 {
        self.attempts.get(path).copied().unwrap_or(0)
    }

    pub fn small_window_reads(&self, path: &str) -> u32 {
        self.small_windows.get(path).copied().unwrap_or(0)
    }

    /// Adaptive read window for `path` at `tier`.
    ///
    /// Baselines 180/300/500 lines by tier, shrunk to the file size for
    /// small files, widened x1.4 after 3 attempts and x1.6 after 5,
    /// capped at 1000.
    pub fn window_for(&self, path: &str, tier: Tier) -> u32 {
        let mut base = match tier {
            Tier::Small => 180,
            Tier::Medium => 300,
            Tier::Large => 500,
        };

        if let Some(&total) = self.known_total_lines.get(path)
            && total < base
        {
            base = total.max(1);
        }

        let attempts = self.attempts(path);
        let multiplier = if attempts >= 5 {
            1.6
        } else if attempts >= 3 {
            1.4
        } else {
            1.0
        };

        (((base as f64) * multiplier) as u32).min(MAX_READ_WINDOW)
    }

    /// Cap a window for reads starting near the file tail.
    fn tail_capped(&self, path: &str, offset: u32, window: u32) -> u32 {
        if let Some(&total) = self.known_total_lines.get(path)
            && offset > total.saturating_sub(NEAR_TAIL_WINDOW)
        {
            return window.min(NEAR_TAIL_WINDOW);
        }
        window
    }
}

/// Outcome of normalization: the canonical input plus any surfaced notes
/// (e.g. a shell preflight warning) the engine shows alongside the result.
#[derive(Debug, Clone)]
pub struct Normalized {
    pub input: Value,
    pub notes: Vec<String>,
}

/// Canonicalize `input` for `tool`.
pub fn normalize_input(
    tool: &str,
    mut input: Value,
    working_dir: &Path,
    tier: Tier,
    planner: &ReadWindowPlanner,
) -> Normalized {
    let mut notes = Vec::new();

    if tool == "glob_search" {
        normalize_glob_pattern(&mut input);
    }
    if DIRECTORY_TOOLS.contains(&tool) {
        normalize_directory(&mut input, working_dir);
    }
    match tool {
        "fs_read" => normalize_fs_read(&mut input, working_dir, tier, planner),
        "shell_exec" => normalize_shell_exec(&mut input, working_dir, &mut notes),
        _ => {}
    }

    debug!(%tool, notes = notes.len(), "normalize_input: done");
    Normalized { input, notes }
}

fn has_glob_metachars(pattern: &str) -> bool {
    pattern.chars().any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}'))
}

fn normalize_glob_pattern(input: &mut Value) {
    let Some(obj) = input.as_object_mut() else { return };

    // `query` is a common model-side alias
    if !obj.contains_key("pattern")
        && let Some(query) = obj.remove("query")
    {
        obj.insert("pattern".to_string(), query);
    }

    if let Some(pattern) = obj.get("pattern").and_then(Value::as_str) {
        let trimmed = pattern.trim();
        if !trimmed.is_empty() && !has_glob_metachars(trimmed) {
            let widened = format!("**/*{trimmed}*");
            obj.insert("pattern".to_string(), Value::String(widened));
        } else if trimmed != pattern {
            obj.insert("pattern".to_string(), Value::String(trimmed.to_string()));
        }
    }
}

fn normalize_directory(input: &mut Value, working_dir: &Path) {
    let Some(obj) = input.as_object_mut() else { return };
    let Some(dir) = obj.get("directory").and_then(Value::as_str) else {
        return;
    };

    let mut path = PathBuf::from(dir);

    // A file path means the model confused file and directory scope
    if path.extension().is_some() {
        path = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    }

    if path.is_absolute()
        && let Ok(relative) = path.strip_prefix(working_dir)
    {
        path = relative.to_path_buf();
    }

    let canonical = if path.as_os_str().is_empty() {
        ".".to_string()
    } else {
        path.to_string_lossy().to_string()
    };
    obj.insert("directory".to_string(), Value::String(canonical));
}

fn normalize_fs_read(input: &mut Value, working_dir: &Path, tier: Tier, planner: &ReadWindowPlanner) {
    let Some(obj) = input.as_object_mut() else { return };

    if let Some(path) = obj.get("path").and_then(Value::as_str) {
        let remapped = remap_read_path(path, working_dir);
        if remapped != path {
            obj.insert("path".to_string(), Value::String(remapped));
        }
    }

    let path = obj
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let offset = match obj.get("offset").and_then(Value::as_u64) {
        Some(o) if o >= 1 => o as u32,
        Some(_) => {
            obj.insert("offset".to_string(), Value::from(1));
            1
        }
        None => 1,
    };

    let window = match obj.get("limit").and_then(Value::as_u64) {
        Some(limit) => (limit as u32).clamp(1, MAX_READ_WINDOW),
        None => planner.window_for(&path, tier),
    };
    let window = planner.tail_capped(&path, offset, window);
    obj.insert("limit".to_string(), Value::from(window));
}

fn remap_read_path(path: &str, working_dir: &Path) -> String {
    for suffix in BACKUP_SUFFIXES {
        if let Some(primary) = path.strip_suffix(suffix)
            && !primary.is_empty()
            && resolve(working_dir, primary).exists()
        {
            return primary.to_string();
        }
    }

    if let Some(stem) = path.strip_suffix(".js") {
        for ext in [".ts", ".tsx"] {
            let candidate = format!("{stem}{ext}");
            if resolve(working_dir, &candidate).exists() {
                return candidate;
            }
        }
    }

    path.to_string()
}

fn resolve(working_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { working_dir.join(p) }
}

fn normalize_shell_exec(input: &mut Value, working_dir: &Path, notes: &mut Vec<String>) {
    let Some(obj) = input.as_object_mut() else { return };

    if obj.get("cwd").and_then(Value::as_str).map(str::is_empty).unwrap_or(true) {
        obj.insert(
            "cwd".to_string(),
            Value::String(working_dir.to_string_lossy().to_string()),
        );
    }

    if let Some(command) = obj.get("command").and_then(Value::as_str)
        && is_risky_command(command)
    {
        notes.push(format!(
            "Preflight: `{}` runs a package script; expect long output and side effects.",
            command.trim()
        ));
    }
}

fn is_risky_command(command: &str) -> bool {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    let Some(first) = tokens.first() else { return false };
    if !matches!(*first, "pnpm" | "npm" | "yarn") {
        return false;
    }
    tokens[1..]
        .iter()
        .any(|t| matches!(*t, "test" | "lint" | "build" | "qa"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn norm(tool: &str, input: Value) -> Value {
        let planner = ReadWindowPlanner::new();
        normalize_input(tool, input, Path::new("/work"), Tier::Small, &planner).input
    }

    #[test]
    fn test_glob_bare_word_widened() {
        let out = norm("glob_search", json!({"pattern": "foo"}));
        assert_eq!(out["pattern"], "**/*foo*");
    }

    #[test]
    fn test_glob_query_alias() {
        let out = norm("glob_search", json!({"query": "foo"}));
        assert_eq!(out["pattern"], "**/*foo*");
        assert!(out.get("query").is_none());
    }

    #[test]
    fn test_glob_existing_metachars_untouched() {
        let out = norm("glob_search", json!({"pattern": "src/**/*.rs"}));
        assert_eq!(out["pattern"], "src/**/*.rs");
    }

    #[test]
    fn test_directory_file_path_uses_parent() {
        let out = norm("grep_search", json!({"pattern": "x", "directory": "src/lib.rs"}));
        assert_eq!(out["directory"], "src");
    }

    #[test]
    fn test_directory_absolute_under_working_dir() {
        let out = norm("grep_search", json!({"pattern": "x", "directory": "/work/src"}));
        assert_eq!(out["directory"], "src");

        let out = norm("grep_search", json!({"pattern": "x", "directory": "/work"}));
        assert_eq!(out["directory"], ".");
    }

    #[test]
    fn test_fs_read_default_window_small_tier() {
        let out = norm("fs_read", json!({"path": "src/lib.rs"}));
        assert_eq!(out["limit"], 180);
        assert_eq!(out.get("offset"), None);
    }

    #[test]
    fn test_fs_read_window_widens_with_attempts() {
        let mut planner = ReadWindowPlanner::new();
        for _ in 0..3 {
            planner.record_attempt("src/lib.rs");
        }
        let out = normalize_input(
            "fs_read",
            json!({"path": "src/lib.rs"}),
            Path::new("/work"),
            Tier::Small,
            &planner,
        )
        .input;
        // 180 * 1.4 = 252
        assert_eq!(out["limit"], 252);

        for _ in 0..2 {
            planner.record_attempt("src/lib.rs");
        }
        let out = normalize_input(
            "fs_read",
            json!({"path": "src/lib.rs"}),
            Path::new("/work"),
            Tier::Small,
            &planner,
        )
        .input;
        // 180 * 1.6 = 288
        assert_eq!(out["limit"], 288);
    }

    #[test]
    fn test_fs_read_small_file_shrinks_window() {
        let mut planner = ReadWindowPlanner::new();
        planner.learn_total_lines("tiny.rs", 40);
        let out = normalize_input("fs_read", json!({"path": "tiny.rs"}), Path::new("/work"), Tier::Large, &planner).input;
        assert_eq!(out["limit"], 40);
    }

    #[test]
    fn test_fs_read_near_tail_cap() {
        let mut planner = ReadWindowPlanner::new();
        planner.learn_total_lines("big.rs", 2000);
        let out = normalize_input(
            "fs_read",
            json!({"path": "big.rs", "offset": 1900, "limit": 800}),
            Path::new("/work"),
            Tier::Large,
            &planner,
        )
        .input;
        assert_eq!(out["limit"], 400);
    }

    #[test]
    fn test_fs_read_offset_floor() {
        let out = norm("fs_read", json!({"path": "a.rs", "offset": 0}));
        assert_eq!(out["offset"], 1);
    }

    #[test]
    fn test_fs_read_backup_remap() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("main.rs"), "fn main() {}").unwrap();

        let planner = ReadWindowPlanner::new();
        let out = normalize_input(
            "fs_read",
            json!({"path": "main.rs.bak"}),
            temp.path(),
            Tier::Small,
            &planner,
        )
        .input;
        assert_eq!(out["path"], "main.rs");
    }

    #[test]
    fn test_fs_read_js_to_ts_remap() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("app.tsx"), "export {}").unwrap();

        let planner = ReadWindowPlanner::new();
        let out = normalize_input("fs_read", json!({"path": "app.js"}), temp.path(), Tier::Small, &planner).input;
        assert_eq!(out["path"], "app.tsx");
    }

    #[test]
    fn test_shell_exec_defaults_cwd_and_flags_risky() {
        let planner = ReadWindowPlanner::new();
        let normalized = normalize_input(
            "shell_exec",
            json!({"command": "pnpm test"}),
            Path::new("/work"),
            Tier::Small,
            &planner,
        );
        assert_eq!(normalized.input["cwd"], "/work");
        assert_eq!(normalized.notes.len(), 1);
        assert!(normalized.notes[0].contains("Preflight"));

        let normalized = normalize_input(
            "shell_exec",
            json!({"command": "ls -la"}),
            Path::new("/work"),
            Tier::Small,
            &planner,
        );
        assert!(normalized.notes.is_empty());
    }

    proptest! {
        // Normalizing twice equals normalizing once, for any input shape.
        #[test]
        fn prop_normalize_idempotent(pattern in "[a-zA-Z0-9_./*?]{0,24}", dir in "[a-zA-Z0-9_./]{0,24}") {
            let planner = ReadWindowPlanner::new();
            let input = json!({"pattern": pattern, "directory": dir});

            for tool in ["glob_search", "grep_search", "fs_read"] {
                let once = normalize_input(tool, input.clone(), Path::new("/work"), Tier::Small, &planner).input;
                let twice = normalize_input(tool, once.clone(), Path::new("/work"), Tier::Small, &planner).input;
                prop_assert_eq!(once, twice);
            }
        }
    }
}
