//! Lean context builder
//!
//! The model never sees the raw full history once it outgrows the sliding
//! window. Every build assembles: enriched system prompt, the task, the
//! last N messages (tool pairs kept intact), deduped summary blocks, and
//! queued user feedback. Each build emits snapshot/diff trace events.

use serde_json::json;

use crate::events::{TraceKind, TraceLog};
use crate::llm::Message;

/// Inputs for one context build.
pub struct ContextInputs<'a> {
    pub base_system: &'a str,
    pub workspace_map: &'a str,
    pub fact_sheet: &'a str,
    pub archive_hint: &'a str,
    pub task: &'a str,
    pub full_history: &'a [Message],
    pub summary_blocks: &'a [String],
    pub feedback: Vec<String>,
    pub iteration: u32,
}

/// LLM-ready context.
#[derive(Debug, Clone)]
pub struct BuiltContext {
    pub system_prompt: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    message_count: usize,
    total_chars: usize,
    system_chars: usize,
}

/// Stateful builder: remembers the previous snapshot for diff events.
#[derive(Debug)]
pub struct ContextBuilder {
    sliding_window: usize,
    previous: Option<Snapshot>,
    seen_summaries: Vec<String>,
}

impl ContextBuilder {
    pub fn new(sliding_window: usize) -> Self {
        Self {
            sliding_window,
            previous: None,
            seen_summaries: Vec::new(),
        }
    }

    /// Build the lean context and emit `context:snapshot` / `context:diff`
    /// (and `context:trim` when the window dropped history).
    pub fn build(&mut self, inputs: ContextInputs<'_>, trace: &TraceLog) -> BuiltContext {
        let mut system_prompt = String::from(inputs.base_system);
        if !inputs.workspace_map.is_empty() {
            system_prompt.push_str("\n\n## Workspace\n");
            system_prompt.push_str(inputs.workspace_map);
        }
        if !inputs.fact_sheet.is_empty() {
            system_prompt.push_str("\n\n");
            system_prompt.push_str(inputs.fact_sheet);
        }
        if !inputs.archive_hint.is_empty() {
            system_prompt.push_str(&format!(
                "\n\nArchive: {}. Use archive_recall for full outputs.",
                inputs.archive_hint
            ));
        }

        let mut messages = vec![Message::user(inputs.task.to_string())];

        let (window, dropped) = sliding_window(inputs.full_history, self.sliding_window);
        messages.extend_from_slice(window);

        for block in inputs.summary_blocks {
            if self.seen_summaries.iter().any(|s| s == block) {
                continue;
            }
            self.seen_summaries.push(block.clone());
            messages.push(Message::assistant(block.clone()));
        }

        for feedback in inputs.feedback {
            messages.push(Message::user(format!("USER FEEDBACK (address this first): {feedback}")));
        }

        let snapshot = Snapshot {
            message_count: messages.len(),
            total_chars: messages.iter().map(Message::char_len).sum(),
            system_chars: system_prompt.len(),
        };

        if dropped > 0 {
            trace.record(
                TraceKind::ContextTrim,
                json!({"iteration": inputs.iteration, "dropped_messages": dropped}),
            );
        }
        trace.record(
            TraceKind::ContextSnapshot,
            json!({
                "iteration": inputs.iteration,
                "messages": snapshot.message_count,
                "chars": snapshot.total_chars,
                "est_tokens": snapshot.total_chars / 4,
                "system_chars": snapshot.system_chars,
            }),
        );
        if let Some(previous) = self.previous {
            trace.record(
                TraceKind::ContextDiff,
                json!({
                    "iteration": inputs.iteration,
                    "messages_added": snapshot.message_count as i64 - previous.message_count as i64,
                    "chars_delta": snapshot.total_chars as i64 - previous.total_chars as i64,
                    "tokens_delta": (snapshot.total_chars as i64 - previous.total_chars as i64) / 4,
                    "dropped_messages": dropped,
                    "system_delta": snapshot.system_chars as i64 - previous.system_chars as i64,
                    "preview": preview(&messages),
                }),
            );
        }
        self.previous = Some(snapshot);

        BuiltContext { system_prompt, messages }
    }
}

/// Last `window` messages, never starting on an orphaned tool result.
fn sliding_window(history: &[Message], window: usize) -> (&[Message], usize) {
    if history.len() <= window {
        return (history, 0);
    }
    let mut start = history.len() - window;
    // A slice must not open with tool results whose tool_use call fell off
    while start > 0 && history[start].has_tool_result() {
        start -= 1;
    }
    (&history[start..], start)
}

fn preview(messages: &[Message]) -> String {
    messages
        .last()
        .map(|m| {
            let text = match &m.content {
                crate::llm::MessageContent::Text(t) => t.clone(),
                crate::llm::MessageContent::Blocks(_) => "[blocks]".to_string(),
            };
            text.chars().take(120).collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CollectingTracer, Tracer};
    use crate::llm::{ContentBlock, Role};
    use std::sync::Arc;
    use std::sync::atomic::AtomicU64;

    fn trace_pair() -> (Arc<CollectingTracer>, TraceLog) {
        let tracer = Arc::new(CollectingTracer::new());
        let log = TraceLog::new(
            Arc::new(AtomicU64::new(0)),
            Arc::clone(&tracer) as Arc<dyn Tracer>,
        );
        (tracer, log)
    }

    fn inputs<'a>(history: &'a [Message], summaries: &'a [String]) -> ContextInputs<'a> {
        ContextInputs {
            base_system: "You are an agent.",
            workspace_map: "- repo (git)",
            fact_sheet: "## Known facts\n- x",
            archive_hint: "3 archived outputs",
            task: "do the thing",
            full_history: history,
            summary_blocks: summaries,
            feedback: Vec::new(),
            iteration: 1,
        }
    }

    #[test]
    fn test_system_prompt_enrichment() {
        let (_tracer, log) = trace_pair();
        let mut builder = ContextBuilder::new(20);
        let built = builder.build(inputs(&[], &[]), &log);

        assert!(built.system_prompt.contains("## Workspace"));
        assert!(built.system_prompt.contains("## Known facts"));
        assert!(built.system_prompt.contains("archive_recall"));
        assert_eq!(built.messages.len(), 1);
    }

    #[test]
    fn test_window_preserves_tool_pairing() {
        let mut history = Vec::new();
        for i in 0..30 {
            history.push(Message::blocks(Role::Assistant, vec![ContentBlock::ToolUse {
                id: format!("t{i}"),
                name: "fs_read".to_string(),
                input: serde_json::json!({}),
            }]));
            history.push(Message::blocks(Role::User, vec![ContentBlock::tool_result(
                format!("t{i}"),
                "out",
                false,
            )]));
        }

        // Odd window would land on a tool_result; the slice must back up
        let (window, dropped) = sliding_window(&history, 7);
        assert!(window[0].has_tool_use());
        assert_eq!(window.len(), 8);
        assert_eq!(dropped, 52);
    }

    #[test]
    fn test_summary_blocks_deduped_across_builds() {
        let (_tracer, log) = trace_pair();
        let mut builder = ContextBuilder::new(20);
        let summaries = vec!["summary one".to_string()];

        let built = builder.build(inputs(&[], &summaries), &log);
        assert_eq!(built.messages.len(), 2);

        // Second build with the same block: not injected again
        let built = builder.build(inputs(&[], &summaries), &log);
        assert_eq!(built.messages.len(), 1);
    }

    #[test]
    fn test_feedback_appended_last() {
        let (_tracer, log) = trace_pair();
        let mut builder = ContextBuilder::new(20);
        let mut input = inputs(&[], &[]);
        input.feedback = vec!["stop touching the docs".to_string()];

        let built = builder.build(input, &log);
        let last = built.messages.last().unwrap();
        assert!(matches!(&last.content, crate::llm::MessageContent::Text(t) if t.contains("USER FEEDBACK")));
    }

    #[test]
    fn test_snapshot_and_diff_events() {
        let (tracer, log) = trace_pair();
        let mut builder = ContextBuilder::new(2);
        let history: Vec<Message> = (0..10).map(|i| Message::assistant(format!("step {i}"))).collect();

        builder.build(inputs(&history, &[]), &log);
        builder.build(inputs(&history, &[]), &log);

        let kinds: Vec<TraceKind> = tracer.events().iter().map(|e| e.kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == TraceKind::ContextSnapshot).count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == TraceKind::ContextDiff).count(), 1);
        assert!(kinds.contains(&TraceKind::ContextTrim));
    }
}
