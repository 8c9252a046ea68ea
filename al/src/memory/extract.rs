//! Heuristic fact extraction
//!
//! Deterministic facts pulled from successful tool results, no LLM involved.
//! The orchestrator filters by configured minimum confidence before adding
//! to the fact sheet; the background summarizer adds the higher-quality
//! facts later.

use serde_json::Value;

use super::fact_sheet::NewFact;

/// Extract facts from one successful tool result.
pub fn extract_facts(tool_name: &str, input: &Value, output: &str, iteration: u32) -> Vec<NewFact> {
    match tool_name {
        "fs_read" => extract_read(input, output, iteration),
        "fs_write" => extract_write(input, output, iteration),
        "fs_list" => extract_list(input, output, iteration),
        "grep_search" => extract_grep(input, output, iteration),
        "find_definition" => extract_definition(input, output, iteration),
        "shell_exec" => extract_shell(input, output, iteration),
        _ => Vec::new(),
    }
}

fn fact(category: &str, text: String, confidence: f64, tool: &str, iteration: u32) -> NewFact {
    NewFact {
        category: category.to_string(),
        fact: text,
        confidence,
        source: tool.to_string(),
        iteration,
    }
}

fn str_arg<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn extract_read(input: &Value, output: &str, iteration: u32) -> Vec<NewFact> {
    let Some(path) = str_arg(input, "path") else {
        return Vec::new();
    };
    let lines = output.lines().count();
    vec![fact(
        "files",
        format!("file {path} exists; {lines} lines read"),
        0.9,
        "fs_read",
        iteration,
    )]
}

fn extract_write(input: &Value, _output: &str, iteration: u32) -> Vec<NewFact> {
    let Some(path) = str_arg(input, "path") else {
        return Vec::new();
    };
    let chars = str_arg(input, "content").map(str::len).unwrap_or(0);
    vec![fact(
        "changes",
        format!("file {path} written ({chars} chars)"),
        0.95,
        "fs_write",
        iteration,
    )]
}

fn extract_list(input: &Value, output: &str, iteration: u32) -> Vec<NewFact> {
    let Some(path) = str_arg(input, "path") else {
        return Vec::new();
    };
    let entries = output.lines().filter(|l| !l.trim().is_empty()).count();
    vec![fact(
        "files",
        format!("directory {path} contains {entries} entries"),
        0.7,
        "fs_list",
        iteration,
    )]
}

/// Lines shaped like `path:line:...` are match locations.
fn match_locations(output: &str) -> Vec<(String, u32)> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ':');
            let path = parts.next()?.trim();
            let line_no: u32 = parts.next()?.trim().parse().ok()?;
            if path.is_empty() || !path.contains('.') {
                return None;
            }
            Some((path.to_string(), line_no))
        })
        .collect()
}

fn extract_grep(input: &Value, output: &str, iteration: u32) -> Vec<NewFact> {
    let pattern = str_arg(input, "pattern").unwrap_or("?");
    let locations = match_locations(output);

    if locations.is_empty() {
        let dir = str_arg(input, "directory").unwrap_or(".");
        return vec![fact(
            "searches",
            format!("pattern '{pattern}' not found under {dir}"),
            0.6,
            "grep_search",
            iteration,
        )];
    }

    locations
        .into_iter()
        .take(3)
        .map(|(path, line)| {
            fact(
                "searches",
                format!("pattern '{pattern}' matched at {path}:{line}"),
                0.8,
                "grep_search",
                iteration,
            )
        })
        .collect()
}

fn extract_definition(input: &Value, output: &str, iteration: u32) -> Vec<NewFact> {
    let Some(symbol) = str_arg(input, "symbol") else {
        return Vec::new();
    };
    match match_locations(output).into_iter().next() {
        Some((path, line)) => vec![fact(
            "symbols",
            format!("symbol {symbol} declared at {path}:{line}"),
            0.85,
            "find_definition",
            iteration,
        )],
        None => vec![fact(
            "searches",
            format!("no declaration of {symbol} found"),
            0.6,
            "find_definition",
            iteration,
        )],
    }
}

fn extract_shell(input: &Value, output: &str, iteration: u32) -> Vec<NewFact> {
    let Some(command) = str_arg(input, "command") else {
        return Vec::new();
    };
    let first_word = command.split_whitespace().next().unwrap_or(command);
    vec![fact(
        "commands",
        format!("`{first_word}` ran; output {} chars", output.len()),
        0.55,
        "shell_exec",
        iteration,
    )]
}
