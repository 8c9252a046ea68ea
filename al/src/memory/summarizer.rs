//! Background memory summarizer
//!
//! Every `summarization_interval` iterations the orchestrator fires one
//! background task over a snapshot of the full history. The task asks the
//! LLM for durable facts and feeds them through the same `add_fact` path as
//! the foreground; the fact-sheet mutex is the only shared state.

use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::fact_sheet::{FactSheet, NewFact};
use crate::events::{TraceKind, TraceLog};
use crate::llm::{ChatRequest, LlmClient, Message, MessageContent, ToolChoice, ToolDefinition};

/// Upper bound on the rendered snapshot fed to the summarizer.
const MAX_SNAPSHOT_CHARS: usize = 12_000;

/// Max facts accepted from one summarization round.
const MAX_FACTS_PER_ROUND: usize = 8;

const FACTS_TOOL: &str = "set_memory_facts";

/// Fire one summarization round in the background. The caller keeps the
/// handle and refrains from spawning another round while this one runs.
pub fn spawn_summarization(
    llm: Arc<dyn LlmClient>,
    model: String,
    snapshot: Vec<Message>,
    fact_sheet: Arc<Mutex<FactSheet>>,
    trace: Arc<TraceLog>,
    iteration: u32,
    min_confidence: f64,
    summary_sink: Arc<std::sync::Mutex<Vec<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_summarization(llm, model, snapshot, fact_sheet, trace, iteration, min_confidence, summary_sink).await;
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_summarization(
    llm: Arc<dyn LlmClient>,
    model: String,
    snapshot: Vec<Message>,
    fact_sheet: Arc<Mutex<FactSheet>>,
    trace: Arc<TraceLog>,
    iteration: u32,
    min_confidence: f64,
    summary_sink: Arc<std::sync::Mutex<Vec<String>>>,
) {
    let rendered = render_snapshot(&snapshot);
    trace.record(
        TraceKind::SummarizationLlmCall,
        json!({"iteration": iteration, "snapshot_chars": rendered.len(), "model": model}),
    );

    let request = ChatRequest {
        model,
        system_prompt: "You distill agent transcripts into durable facts. \
                        Record only things worth remembering across many steps: \
                        file locations, symbols, confirmed behaviors, dead ends."
            .to_string(),
        messages: vec![Message::user(rendered)],
        tools: vec![facts_tool()],
        tool_choice: ToolChoice::Tool(FACTS_TOOL.to_string()),
        max_tokens: 1024,
        temperature: None,
    };

    let response = match llm.chat(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "summarization LLM call failed");
            trace.record(
                TraceKind::SummarizationResult,
                json!({"iteration": iteration, "facts_added": 0, "error": e.to_string()}),
            );
            return;
        }
    };

    let facts = response
        .tool_calls
        .iter()
        .find(|c| c.name == FACTS_TOOL)
        .map(|c| parse_facts(&c.input, iteration))
        .unwrap_or_default();

    let mut added = 0usize;
    for fact in facts.into_iter().take(MAX_FACTS_PER_ROUND) {
        if fact.confidence < min_confidence {
            continue;
        }
        let outcome = {
            // Critical section is the add_fact body only
            let mut sheet = fact_sheet.lock().await;
            sheet.add_fact(fact.clone())
        };
        trace.record(
            TraceKind::FactAdded,
            json!({
                "id": outcome.id,
                "merged": outcome.merged,
                "category": fact.category,
                "source": "summarizer",
            }),
        );
        added += 1;
    }

    if added > 0 {
        summary_sink
            .lock()
            .expect("summary sink poisoned")
            .push(format!("Background summarization after iteration {iteration}: {added} durable fact(s) recorded."));
    }
    debug!(iteration, added, "summarization round complete");
    trace.record(
        TraceKind::SummarizationResult,
        json!({"iteration": iteration, "facts_added": added}),
    );
}

fn facts_tool() -> ToolDefinition {
    ToolDefinition::new(
        FACTS_TOOL,
        "Record durable facts extracted from the transcript",
        json!({
            "type": "object",
            "properties": {
                "facts": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "category": {"type": "string"},
                            "fact": {"type": "string", "maxLength": 280},
                            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
                        },
                        "required": ["category", "fact", "confidence"]
                    }
                }
            },
            "required": ["facts"]
        }),
    )
}

fn parse_facts(input: &Value, iteration: u32) -> Vec<NewFact> {
    input
        .get("facts")
        .and_then(Value::as_array)
        .map(|facts| {
            facts
                .iter()
                .filter_map(|f| {
                    let fact = f.get("fact")?.as_str()?.trim();
                    if fact.is_empty() {
                        return None;
                    }
                    Some(NewFact {
                        category: f.get("category").and_then(Value::as_str).unwrap_or("general").to_string(),
                        fact: fact.to_string(),
                        confidence: f.get("confidence").and_then(Value::as_f64).unwrap_or(0.5).clamp(0.0, 1.0),
                        source: "summarizer".to_string(),
                        iteration,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Flatten a history snapshot, keeping the tail when over budget.
fn render_snapshot(messages: &[Message]) -> String {
    let mut lines: Vec<String> = messages
        .iter()
        .map(|m| {
            let role = match m.role {
                crate::llm::Role::User => "user",
                crate::llm::Role::Assistant => "assistant",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| match b {
                        crate::llm::ContentBlock::Text { text } => text.clone(),
                        crate::llm::ContentBlock::ToolUse { name, input, .. } => {
                            format!("[tool_use {name} {input}]")
                        }
                        crate::llm::ContentBlock::ToolResult { content, .. } => {
                            format!("[tool_result {}]", truncate(content, 400))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" "),
            };
            format!("{role}: {text}")
        })
        .collect();

    let mut total: usize = lines.iter().map(String::len).sum();
    while total > MAX_SNAPSHOT_CHARS && lines.len() > 1 {
        total -= lines.remove(0).len();
    }
    lines.join("\n")
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}
