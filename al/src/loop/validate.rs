//! Task completion validator
//!
//! When the model stops calling tools, its final text is either accepted
//! verbatim (informational fast path), judged by a forced-tool LLM call, or
//! - when that call fails - by an evidence heuristic.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::llm::{ChatRequest, LlmClient, LlmError, Message, ToolChoice, ToolDefinition};

/// Fast-path evidence sufficiency floors.
const MIN_FILES_READ: usize = 2;
const MIN_EVIDENCE_DENSITY: f64 = 0.20;

/// Excerpt limits for the LLM judgment call.
const MAX_EXCERPT_FILES: usize = 3;
const MAX_EXCERPT_CHARS: usize = 1000;

const VALIDATE_TOOL: &str = "set_validation_result";

/// Everything the validator looks at.
#[derive(Debug, Clone)]
pub struct ValidationInputs<'a> {
    pub task: &'a str,
    pub response_text: &'a str,
    pub informational: bool,
    pub min_response_chars: usize,
    pub files_read: usize,
    pub files_modified: usize,
    pub files_created: usize,
    pub evidence_density: f64,
    pub search_signal_hits: u32,
    pub no_result_concluded: bool,
    /// Previous runs of the same normalized task produced file changes.
    pub prior_runs_changed_files: bool,
    /// `(path, excerpt)` pairs of the most relevant touched files.
    pub file_excerpts: &'a [(String, String)],
}

impl ValidationInputs<'_> {
    fn has_file_changes(&self) -> bool {
        self.files_modified + self.files_created > 0
    }

    fn has_evidence(&self) -> bool {
        self.files_read + self.files_modified + self.files_created > 0 || self.search_signal_hits > 0
    }
}

/// Validator verdict.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub success: bool,
    pub summary: String,
    /// True when the model's text was accepted unchanged.
    pub accepted_verbatim: bool,
}

/// Informational fast path: a substantial answer with evidence markers and
/// enough gathered evidence is accepted verbatim.
pub fn informational_fast_path(inputs: &ValidationInputs<'_>) -> Option<ValidationOutcome> {
    if !inputs.informational {
        return None;
    }
    if inputs.response_text.len() < inputs.min_response_chars {
        return None;
    }
    if !has_evidence_markers(inputs.response_text) {
        return None;
    }
    let sufficient = inputs.files_read >= MIN_FILES_READ
        || inputs.evidence_density >= MIN_EVIDENCE_DENSITY
        || inputs.search_signal_hits > 0;
    if !sufficient {
        return None;
    }

    debug!("informational fast path accepted response verbatim");
    Some(ValidationOutcome {
        success: true,
        summary: inputs.response_text.to_string(),
        accepted_verbatim: true,
    })
}

/// File paths, line references or code fences count as evidence markers.
fn has_evidence_markers(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    text.split_whitespace().any(|token| {
        let token = token.trim_matches(|c: char| matches!(c, ',' | ';' | ')' | '(' | '`'));
        // `path/file.ext` or `file.ext:123`
        (token.contains('/') && token.contains('.'))
            || token
                .rsplit_once(':')
                .map(|(left, right)| left.contains('.') && right.chars().all(|c| c.is_ascii_digit()) && !right.is_empty())
                .unwrap_or(false)
    })
}

/// LLM judgment with the evidence laid out.
pub async fn validate_with_llm(
    llm: &dyn LlmClient,
    model: &str,
    inputs: &ValidationInputs<'_>,
) -> Result<ValidationOutcome, LlmError> {
    let mut prompt = format!(
        "Task: {}\n\nAgent's final response:\n{}\n\nFiles read: {}, modified: {}, created: {}.\n",
        inputs.task, inputs.response_text, inputs.files_read, inputs.files_modified, inputs.files_created,
    );
    if inputs.prior_runs_changed_files {
        prompt.push_str("Previous runs of this same task produced file changes.\n");
    }
    for (path, excerpt) in inputs.file_excerpts.iter().take(MAX_EXCERPT_FILES) {
        let clipped: String = excerpt.chars().take(MAX_EXCERPT_CHARS).collect();
        prompt.push_str(&format!("\n--- {path} ---\n{clipped}\n"));
    }
    prompt.push_str("\nDid the agent complete the task? Summarize what was actually accomplished.");

    let request = ChatRequest {
        model: model.to_string(),
        system_prompt: "You judge whether an autonomous agent completed its task, \
                        based on evidence rather than claims."
            .to_string(),
        messages: vec![Message::user(prompt)],
        tools: vec![validate_tool()],
        tool_choice: ToolChoice::Tool(VALIDATE_TOOL.to_string()),
        max_tokens: 1024,
        temperature: None,
    };

    let response = llm.chat(request).await?;
    let call = response
        .tool_calls
        .iter()
        .find(|c| c.name == VALIDATE_TOOL)
        .ok_or_else(|| LlmError::InvalidResponse("validator returned no tool call".to_string()))?;

    let success = call.input.get("success").and_then(Value::as_bool).unwrap_or(false);
    let summary = call
        .input
        .get("summary")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(inputs.response_text)
        .to_string();

    Ok(ValidationOutcome {
        success,
        summary,
        accepted_verbatim: false,
    })
}

/// Heuristic applied when the LLM judgment itself fails.
pub fn fallback(inputs: &ValidationInputs<'_>) -> ValidationOutcome {
    let success = inputs.has_file_changes() || inputs.has_evidence() || inputs.no_result_concluded;
    warn!(success, "validator fell back to evidence heuristic");
    ValidationOutcome {
        success,
        summary: inputs.response_text.to_string(),
        accepted_verbatim: true,
    }
}

fn validate_tool() -> ToolDefinition {
    ToolDefinition::new(
        VALIDATE_TOOL,
        "Record the completion judgment",
        json!({
            "type": "object",
            "properties": {
                "success": {"type": "boolean"},
                "summary": {"type": "string"}
            },
            "required": ["success", "summary"]
        }),
    )
}
