//! Search signal tracking and no-result convergence
//!
//! After any iteration that ran search tools, result previews are classified
//! into none/partial/strong - by the LLM when possible, by a path-token
//! heuristic otherwise. Repeated no-signal searches on a discovery task
//! converge to an early successful conclusion instead of burning budget.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use tracing::debug;

use crate::config::NoSignalLimits;
use crate::domain::Intent;
use crate::llm::{ChatRequest, LlmClient, LlmError, Message, Tier, ToolChoice, ToolDefinition};

/// Characters of each search result fed to classification.
pub const PREVIEW_CHARS: usize = 2000;

/// Max evidence snippets accepted from one classification.
const MAX_CLASSIFIED_SNIPPETS: usize = 6;

/// Bound on the retained recent-evidence list.
const MAX_RECENT_EVIDENCE: usize = 8;

const CLASSIFY_TOOL: &str = "classify_search_signal";

/// Combined strength of an iteration's search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchSignal {
    None,
    Partial,
    Strong,
}

/// One classification outcome.
#[derive(Debug, Clone)]
pub struct SearchAssessment {
    pub signal: SearchSignal,
    pub evidence: Vec<String>,
}

/// Search-signal state for one run.
#[derive(Debug, Default)]
pub struct SearchSignalTracker {
    search_signal_hits: u32,
    consecutive_no_signal: u32,
    last_signal_iteration: Option<u32>,
    recent_evidence: Vec<String>,
    attempts_by_tool: BTreeMap<String, u32>,
}

impl SearchSignalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record which search tools ran this iteration.
    pub fn record_attempts(&mut self, tool_names: &[&str]) {
        for name in tool_names {
            *self.attempts_by_tool.entry((*name).to_string()).or_default() += 1;
        }
    }

    /// Fold one assessment into the state.
    pub fn apply(&mut self, assessment: &SearchAssessment, iteration: u32) {
        match assessment.signal {
            SearchSignal::None => {
                self.consecutive_no_signal += 1;
            }
            SearchSignal::Partial => {
                self.search_signal_hits += 1;
                self.consecutive_no_signal = 0;
                self.last_signal_iteration = Some(iteration);
            }
            SearchSignal::Strong => {
                self.search_signal_hits += 2;
                self.consecutive_no_signal = 0;
                self.last_signal_iteration = Some(iteration);
            }
        }

        for snippet in &assessment.evidence {
            let snippet = snippet.trim();
            if snippet.is_empty() || self.recent_evidence.iter().any(|e| e == snippet) {
                continue;
            }
            if self.recent_evidence.len() == MAX_RECENT_EVIDENCE {
                self.recent_evidence.remove(0);
            }
            self.recent_evidence.push(snippet.to_string());
        }

        debug!(
            signal = ?assessment.signal,
            hits = self.search_signal_hits,
            consecutive_no_signal = self.consecutive_no_signal,
            "SearchSignalTracker::apply"
        );
    }

    pub fn hits(&self) -> u32 {
        self.search_signal_hits
    }

    pub fn consecutive_no_signal(&self) -> u32 {
        self.consecutive_no_signal
    }

    pub fn last_signal_iteration(&self) -> Option<u32> {
        self.last_signal_iteration
    }

    /// Signal seen within the last `window` iterations.
    pub fn signal_within(&self, iteration: u32, window: u32) -> bool {
        self.last_signal_iteration
            .map(|last| iteration.saturating_sub(last) <= window)
            .unwrap_or(false)
    }

    pub fn recent_evidence(&self) -> &[String] {
        &self.recent_evidence
    }

    /// Whether the run should conclude early with a no-result summary.
    pub fn should_conclude_no_result(
        &self,
        intent: Intent,
        task: &str,
        iteration: u32,
        tier: Tier,
        evidence_count: usize,
        min_iterations: u32,
        limits: &NoSignalLimits,
    ) -> bool {
        intent != Intent::Action
            && looks_like_discovery(task)
            && iteration >= min_iterations
            && self.consecutive_no_signal >= limits.for_tier(tier)
            && self.search_signal_hits == 0
            && evidence_count <= 1
    }

    /// The conclusion summary: what was searched, what remains uncertain.
    pub fn no_result_summary(&self, task: &str) -> String {
        let mut out = String::from("Insufficient evidence found after repeated search attempts.\n\n");
        out.push_str(&format!("Task: {task}\n\nSearched with:\n"));
        for (tool, count) in &self.attempts_by_tool {
            out.push_str(&format!("- {tool} ({count})\n"));
        }
        if self.recent_evidence.is_empty() {
            out.push_str("\nNo partial matches surfaced. ");
        } else {
            out.push_str("\nPartial matches that did not pan out:\n");
            for snippet in &self.recent_evidence {
                out.push_str(&format!("- {snippet}\n"));
            }
        }
        out.push_str(
            "\nWhat remains uncertain: the target may exist under a different name, \
             outside the current scope, or not at all.",
        );
        out
    }
}

/// Heuristic for "this task is a lookup, not a change".
pub fn looks_like_discovery(task: &str) -> bool {
    let task = task.to_lowercase();
    const MARKERS: &[&str] = &[
        "where", "find", "locate", "search", "which", "what", "is there", "does ", "defined", "declared", "?",
    ];
    MARKERS.iter().any(|m| task.contains(m))
}

/// Classify previews with the LLM; callers fall back to
/// [`heuristic_classify`] on error.
pub async fn assess_with_llm(
    llm: &dyn LlmClient,
    model: &str,
    task: &str,
    previews: &[String],
) -> Result<SearchAssessment, LlmError> {
    let mut prompt = format!("Task under investigation: {task}\n\nSearch results from this iteration:\n");
    for (i, preview) in previews.iter().enumerate() {
        let clipped: String = preview.chars().take(PREVIEW_CHARS).collect();
        prompt.push_str(&format!("--- result {} ---\n{}\n", i + 1, clipped));
    }

    let request = ChatRequest {
        model: model.to_string(),
        system_prompt: "Classify how strongly these search results answer the task."
            .to_string(),
        messages: vec![Message::user(prompt)],
        tools: vec![classify_tool()],
        tool_choice: ToolChoice::Tool(CLASSIFY_TOOL.to_string()),
        max_tokens: 512,
        temperature: None,
    };

    let response = llm.chat(request).await?;
    let call = response
        .tool_calls
        .iter()
        .find(|c| c.name == CLASSIFY_TOOL)
        .ok_or_else(|| LlmError::InvalidResponse("classifier returned no tool call".to_string()))?;

    let signal = match call.input.get("signal").and_then(Value::as_str) {
        Some("strong") => SearchSignal::Strong,
        Some("partial") => SearchSignal::Partial,
        Some("none") => SearchSignal::None,
        other => {
            return Err(LlmError::InvalidResponse(format!("bad signal value: {other:?}")));
        }
    };

    let evidence = call
        .input
        .get("evidence")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .take(MAX_CLASSIFIED_SNIPPETS)
                .collect()
        })
        .unwrap_or_default();

    Ok(SearchAssessment { signal, evidence })
}

fn classify_tool() -> ToolDefinition {
    ToolDefinition::new(
        CLASSIFY_TOOL,
        "Record the combined strength of the search results",
        json!({
            "type": "object",
            "properties": {
                "signal": {"type": "string", "enum": ["none", "partial", "strong"]},
                "evidence": {
                    "type": "array",
                    "items": {"type": "string"},
                    "maxItems": MAX_CLASSIFIED_SNIPPETS
                }
            },
            "required": ["signal"]
        }),
    )
}

/// Deterministic fallback: a path-like token means partial signal; uniform
/// not-found noise means none.
pub fn heuristic_classify(previews: &[String]) -> SearchAssessment {
    let mut evidence = Vec::new();
    for preview in previews {
        for token in preview.split_whitespace() {
            let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.' && c != '_');
            if is_path_like(token) {
                evidence.push(token.to_string());
                if evidence.len() == MAX_CLASSIFIED_SNIPPETS {
                    break;
                }
            }
        }
    }

    if !evidence.is_empty() {
        return SearchAssessment {
            signal: SearchSignal::Partial,
            evidence,
        };
    }

    SearchAssessment {
        signal: SearchSignal::None,
        evidence: Vec::new(),
    }
}

fn is_path_like(token: &str) -> bool {
    if token.len() < 4 {
        return false;
    }
    let has_extension = token
        .rsplit_once('.')
        .map(|(stem, ext)| !stem.is_empty() && (1..=4).contains(&ext.len()) && ext.chars().all(|c| c.is_ascii_alphabetic()))
        .unwrap_or(false);
    if token.contains('/') {
        return has_extension || token.matches('/').count() >= 2;
    }
    // Bare filename like `parser.rs`
    has_extension && token.len() >= 6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::llm::ChatResponse;
    use crate::llm::client::mock::MockLlmClient;

    fn assessment(signal: SearchSignal, evidence: &[&str]) -> SearchAssessment {
        SearchAssessment {
            signal,
            evidence: evidence.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_no_signal_accumulates() {
        let mut tracker = SearchSignalTracker::new();
        for i in 1..=3 {
            tracker.apply(&assessment(SearchSignal::None, &[]), i);
        }
        assert_eq!(tracker.consecutive_no_signal(), 3);
        assert_eq!(tracker.hits(), 0);
        assert_eq!(tracker.last_signal_iteration(), None);
    }

    #[test]
    fn test_partial_resets_no_signal_run() {
        let mut tracker = SearchSignalTracker::new();
        tracker.apply(&assessment(SearchSignal::None, &[]), 1);
        tracker.apply(&assessment(SearchSignal::Partial, &["src/foo.rs:10"]), 2);

        assert_eq!(tracker.consecutive_no_signal(), 0);
        assert_eq!(tracker.hits(), 1);
        assert_eq!(tracker.last_signal_iteration(), Some(2));
        assert!(tracker.signal_within(4, 3));
        assert!(!tracker.signal_within(8, 3));
    }

    #[test]
    fn test_evidence_deduped_and_bounded() {
        let mut tracker = SearchSignalTracker::new();
        for i in 0..12 {
            tracker.apply(
                &assessment(SearchSignal::Partial, &[&format!("snippet {i}"), "snippet 0"]),
                i,
            );
        }
        assert_eq!(tracker.recent_evidence().len(), MAX_RECENT_EVIDENCE);
        // Only one copy of the duplicate
        let dupes = tracker.recent_evidence().iter().filter(|e| *e == "snippet 0").count();
        assert!(dupes <= 1);
    }

    #[test]
    fn test_should_conclude_no_result_gating() {
        let mut tracker = SearchSignalTracker::new();
        let config = EngineConfig::default();
        for i in 1..=3 {
            tracker.apply(&assessment(SearchSignal::None, &[]), i);
        }

        let conclude = |intent, task: &str, iteration, evidence| {
            tracker.should_conclude_no_result(
                intent,
                task,
                iteration,
                Tier::Small,
                evidence,
                config.min_iterations_before_conclusion,
                &config.no_signal_limits,
            )
        };

        assert!(conclude(Intent::Discovery, "Where is class Foo defined?", 3, 0));
        // Action tasks never conclude early
        assert!(!conclude(Intent::Action, "Where is class Foo defined?", 3, 0));
        // Too early
        assert!(!conclude(Intent::Discovery, "Where is class Foo defined?", 2, 0));
        // Too much evidence already gathered
        assert!(!conclude(Intent::Discovery, "Where is class Foo defined?", 3, 2));
        // Task does not read as discovery
        assert!(!conclude(Intent::Analysis, "refactor the parser module", 3, 0));
    }

    #[test]
    fn test_no_result_summary_lists_tools_with_counts() {
        let mut tracker = SearchSignalTracker::new();
        tracker.record_attempts(&["grep_search", "glob_search"]);
        tracker.record_attempts(&["grep_search", "find_definition"]);
        for i in 1..=3 {
            tracker.apply(&assessment(SearchSignal::None, &[]), i);
        }

        let summary = tracker.no_result_summary("Where is class Foo defined?");
        assert!(summary.starts_with("Insufficient evidence found after repeated search attempts"));
        assert!(summary.contains("grep_search (2)"));
        assert!(summary.contains("glob_search (1)"));
        assert!(summary.contains("find_definition (1)"));
    }

    #[test]
    fn test_heuristic_classify_path_token() {
        let result = heuristic_classify(&["found in src/parser/mod.rs line 42".to_string()]);
        assert_eq!(result.signal, SearchSignal::Partial);
        assert!(result.evidence.iter().any(|e| e.contains("src/parser/mod.rs")));
    }

    #[test]
    fn test_heuristic_classify_not_found() {
        let result = heuristic_classify(&["No matches found".to_string(), "0 results".to_string()]);
        assert_eq!(result.signal, SearchSignal::None);
        assert!(result.evidence.is_empty());
    }

    #[tokio::test]
    async fn test_assess_with_llm_parses_forced_tool() {
        let llm = MockLlmClient::new(vec![]).on_forced_tool(
            CLASSIFY_TOOL,
            ChatResponse::tool_use(
                "c1",
                CLASSIFY_TOOL,
                json!({"signal": "strong", "evidence": ["src/foo.rs:10: class Foo"]}),
            ),
        );

        let result = assess_with_llm(&llm, "small-model", "find Foo", &["src/foo.rs:10: class Foo".to_string()])
            .await
            .unwrap();
        assert_eq!(result.signal, SearchSignal::Strong);
        assert_eq!(result.evidence.len(), 1);
    }

    #[tokio::test]
    async fn test_assess_with_llm_error_bubbles() {
        let llm = MockLlmClient::new(vec![]);
        let result = assess_with_llm(&llm, "small-model", "find Foo", &["x".to_string()]).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_looks_like_discovery() {
        assert!(looks_like_discovery("Where is class Foo defined?"));
        assert!(looks_like_discovery("find the config loader"));
        assert!(!looks_like_discovery("create file hello.txt with text Hi"));
    }
}
