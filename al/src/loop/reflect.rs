//! Reflection engine - structured self-checks on stall or failure
//!
//! A reflection is one forced-tool LLM call producing a bounded hypothesis
//! record. The compact summary goes back into the conversation as an
//! assistant message; hypothesis switches feed KPI regression detection.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::llm::{ChatRequest, LlmClient, Message, ToolChoice, ToolDefinition};

/// Character bound on every reflection field.
const MAX_FIELD_CHARS: usize = 220;

const REFLECT_TOOL: &str = "set_reflection";

/// Why a reflection is being considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionTrigger {
    PostTools,
    BeforeEscalation,
    BeforeNoResult,
}

/// One structured reflection checkpoint.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub hypothesis: String,
    pub confidence: f64,
    pub evidence_for: String,
    pub evidence_against: String,
    pub next_best_check: String,
    pub why_this_check: String,
}

impl Reflection {
    /// Compact form appended to the conversation.
    pub fn summary_message(&self) -> String {
        format!(
            "Reflection: {} (confidence {:.2}). For: {}. Against: {}. Next check: {} - {}",
            self.hypothesis,
            self.confidence,
            self.evidence_for,
            self.evidence_against,
            self.next_best_check,
            self.why_this_check,
        )
    }
}

/// Reflection state for one run.
#[derive(Debug, Default)]
pub struct ReflectionEngine {
    last_reflection_iteration: Option<u32>,
    last_hypothesis: Option<String>,
    hypothesis_switches: u32,
    reflections_made: u32,
}

impl ReflectionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate: forced triggers always pass; otherwise require at least one
    /// quiet iteration since the last reflection plus a concrete smell.
    pub fn should_reflect(
        &self,
        force: bool,
        iteration: u32,
        failures_this_iteration: u32,
        repeated_single_tool: bool,
        near_stuck: bool,
    ) -> bool {
        if force {
            return true;
        }
        let spaced = match self.last_reflection_iteration {
            Some(last) => iteration > last + 1,
            None => true,
        };
        spaced && (failures_this_iteration > 0 || repeated_single_tool || near_stuck)
    }

    /// Run one reflection call. Returns None (and logs) on any failure;
    /// reflection is advisory and never sinks a run.
    pub async fn reflect(
        &mut self,
        llm: &dyn LlmClient,
        model: &str,
        trigger: ReflectionTrigger,
        iteration: u32,
        situation: &str,
    ) -> Option<Reflection> {
        let request = ChatRequest {
            model: model.to_string(),
            system_prompt: "You are the agent's inner critic. State the current working hypothesis \
                            and the single best next check. Be terse; every field is capped."
                .to_string(),
            messages: vec![Message::user(format!(
                "Trigger: {trigger:?} at iteration {iteration}.\n\n{situation}"
            ))],
            tools: vec![reflect_tool()],
            tool_choice: ToolChoice::Tool(REFLECT_TOOL.to_string()),
            max_tokens: 512,
            temperature: None,
        };

        let response = match llm.chat(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "reflection call failed");
                return None;
            }
        };
        let call = response.tool_calls.iter().find(|c| c.name == REFLECT_TOOL)?;

        let reflection = parse_reflection(&call.input)?;
        self.record(iteration, &reflection.hypothesis);
        debug!(iteration, switches = self.hypothesis_switches, "reflection recorded");
        Some(reflection)
    }

    fn record(&mut self, iteration: u32, hypothesis: &str) {
        let normalized = hypothesis.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ");
        if let Some(previous) = &self.last_hypothesis
            && previous != &normalized
        {
            self.hypothesis_switches += 1;
        }
        self.last_hypothesis = Some(normalized);
        self.last_reflection_iteration = Some(iteration);
        self.reflections_made += 1;
    }

    pub fn hypothesis_switches(&self) -> u32 {
        self.hypothesis_switches
    }

    pub fn reflections_made(&self) -> u32 {
        self.reflections_made
    }
}

fn parse_reflection(input: &Value) -> Option<Reflection> {
    let field = |key: &str| -> String {
        let raw = input.get(key).and_then(Value::as_str).unwrap_or_default().trim();
        raw.chars().take(MAX_FIELD_CHARS).collect()
    };

    let hypothesis = field("hypothesis");
    if hypothesis.is_empty() {
        return None;
    }

    Some(Reflection {
        hypothesis,
        confidence: input
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0),
        evidence_for: field("evidenceFor"),
        evidence_against: field("evidenceAgainst"),
        next_best_check: field("nextBestCheck"),
        why_this_check: field("whyThisCheck"),
    })
}

fn reflect_tool() -> ToolDefinition {
    let capped_string = json!({"type": "string", "maxLength": MAX_FIELD_CHARS});
    ToolDefinition::new(
        REFLECT_TOOL,
        "Record a structured reflection checkpoint",
        json!({
            "type": "object",
            "properties": {
                "hypothesis": capped_string,
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "evidenceFor": capped_string,
                "evidenceAgainst": capped_string,
                "nextBestCheck": capped_string,
                "whyThisCheck": capped_string
            },
            "required": ["hypothesis", "confidence", "nextBestCheck"]
        }),
    )
}
