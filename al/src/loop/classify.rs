//! Task classifier - one small-tier LLM call before the loop
//!
//! Infers `{intent, budget}` from the task text. Failure is never fatal:
//! the fallback is an action intent with the configured default budget.

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::domain::Intent;
use crate::llm::{ChatRequest, LlmClient, Message, ToolChoice, ToolDefinition};

const CLASSIFY_TOOL: &str = "set_classification";

/// Classifier output. `budget` is the raw suggestion; the budget controller
/// clamps it.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub intent: Intent,
    /// None when the classifier failed or returned garbage.
    pub budget: Option<u32>,
}

impl Classification {
    /// The fallback when classification fails outright.
    pub fn fallback() -> Self {
        Self {
            intent: Intent::Action,
            budget: None,
        }
    }
}

/// Classify `task`. Infallible by design.
pub async fn classify_task(llm: &dyn LlmClient, model: &str, task: &str) -> Classification {
    let request = ChatRequest {
        model: model.to_string(),
        system_prompt: "Classify the user task for an autonomous coding agent. \
                        `action` changes things, `discovery` locates things, `analysis` explains things. \
                        Budget is the number of tool-using iterations a competent agent needs."
            .to_string(),
        messages: vec![Message::user(task.to_string())],
        tools: vec![classify_tool()],
        tool_choice: ToolChoice::Tool(CLASSIFY_TOOL.to_string()),
        max_tokens: 256,
        temperature: None,
    };

    let response = match llm.chat(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "task classification failed, using fallback");
            return Classification::fallback();
        }
    };

    let Some(call) = response.tool_calls.iter().find(|c| c.name == CLASSIFY_TOOL) else {
        warn!("classifier returned no tool call, using fallback");
        return Classification::fallback();
    };

    let intent = call
        .input
        .get("intent")
        .and_then(Value::as_str)
        .and_then(Intent::parse)
        .unwrap_or(Intent::Action);
    let budget = call
        .input
        .get("budget")
        .and_then(Value::as_u64)
        .map(|b| b as u32);

    debug!(?intent, ?budget, "classify_task: done");
    Classification { intent, budget }
}

fn classify_tool() -> ToolDefinition {
    ToolDefinition::new(
        CLASSIFY_TOOL,
        "Record the task classification",
        json!({
            "type": "object",
            "properties": {
                "intent": {"type": "string", "enum": ["action", "discovery", "analysis"]},
                "budget": {"type": "integer", "minimum": 1}
            },
            "required": ["intent", "budget"]
        }),
    )
}
