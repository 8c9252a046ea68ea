//! Anthropic Messages API client
//!
//! The one provider implementation shipped with the engine. The model id
//! comes from the request (the engine resolves tiers to models), so a single
//! client serves every tier.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{
    ChatRequest, ChatResponse, ContentBlock, LlmClient, LlmError, Message, MessageContent, StopReason, TokenUsage,
    ToolCall, ToolChoice,
};

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API client.
pub struct AnthropicClient {
    api_key: String,
    base_url: String,
    http: Client,
    max_tokens: u32,
}

impl AnthropicClient {
    /// Create a client. The API key comes from the named environment variable.
    pub fn from_env(api_key_env: &str, base_url: impl Into<String>, timeout: Duration) -> Result<Self, LlmError> {
        let api_key = std::env::var(api_key_env)
            .map_err(|_| LlmError::InvalidResponse(format!("Environment variable {api_key_env} not set")))?;

        let http = Client::builder().timeout(timeout).build().map_err(LlmError::Network)?;

        Ok(Self {
            api_key,
            base_url: base_url.into(),
            http,
            max_tokens: 16384,
        })
    }

    fn build_request_body(&self, request: &ChatRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens.min(self.max_tokens),
            "system": request.system_prompt,
            "messages": convert_messages(&request.messages),
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(
                request.tools.iter().map(|t| t.to_api_schema()).collect::<Vec<_>>()
            );
        }
        match &request.tool_choice {
            ToolChoice::Auto => {}
            ToolChoice::None => {
                body["tool_choice"] = serde_json::json!({"type": "none"});
            }
            ToolChoice::Tool(name) => {
                body["tool_choice"] = serde_json::json!({"type": "tool", "name": name});
            }
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        body
    }

    fn parse_response(&self, api_response: ApiResponse) -> ChatResponse {
        let mut content = None;
        let mut tool_calls = Vec::new();

        for block in api_response.content {
            match block {
                ApiContentBlock::Text { text } => {
                    content = Some(text);
                }
                ApiContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall { id, name, input });
                }
            }
        }

        ChatResponse {
            content,
            tool_calls,
            stop_reason: StopReason::from_api(&api_response.stop_reason),
            usage: TokenUsage {
                input_tokens: api_response.usage.input_tokens,
                output_tokens: api_response.usage.output_tokens,
                cache_read_tokens: api_response.usage.cache_read_input_tokens.unwrap_or(0),
                cache_creation_tokens: api_response.usage.cache_creation_input_tokens.unwrap_or(0),
            },
            model: api_response.model,
        }
    }
}

fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            let content = match &msg.content {
                MessageContent::Text(text) => serde_json::json!(text),
                MessageContent::Blocks(blocks) => {
                    serde_json::json!(blocks.iter().map(convert_content_block).collect::<Vec<_>>())
                }
            };

            serde_json::json!({
                "role": msg.role,
                "content": content,
            })
        })
        .collect()
}

fn convert_content_block(block: &ContentBlock) -> serde_json::Value {
    match block {
        ContentBlock::Text { text } => serde_json::json!({
            "type": "text",
            "text": text,
        }),
        ContentBlock::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);

        let response = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(60);

            return Err(LlmError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::ApiError { status, message: text });
        }

        let api_response: ApiResponse = response.json().await?;
        Ok(self.parse_response(api_response))
    }
}

// === API response deserialization ===

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContentBlock>,
    stop_reason: String,
    usage: ApiUsage,
    model: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_input_tokens: Option<u64>,
    cache_creation_input_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolDefinition;

    fn client() -> AnthropicClient {
        AnthropicClient {
            api_key: "test-key".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            http: Client::new(),
            max_tokens: 16384,
        }
    }

    #[test]
    fn test_build_request_body_plain() {
        let request = ChatRequest::completion("claude-haiku-4-5", "be brief", "hi");
        let body = client().build_request_body(&request);

        assert_eq!(body["model"], "claude-haiku-4-5");
        assert_eq!(body["system"], "be brief");
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_build_request_body_tool_choice() {
        let mut request = ChatRequest::completion("m", "sys", "hi");
        request.tools = vec![ToolDefinition::new("set_reflection", "record", serde_json::json!({"type": "object"}))];
        request.tool_choice = ToolChoice::Tool("set_reflection".to_string());

        let body = client().build_request_body(&request);
        assert_eq!(body["tool_choice"]["type"], "tool");
        assert_eq!(body["tool_choice"]["name"], "set_reflection");
        assert_eq!(body["tools"][0]["name"], "set_reflection");
    }

    #[test]
    fn test_build_request_body_tool_choice_none() {
        let mut request = ChatRequest::completion("m", "sys", "hi");
        request.tool_choice = ToolChoice::None;

        let body = client().build_request_body(&request);
        assert_eq!(body["tool_choice"]["type"], "none");
    }

    #[test]
    fn test_parse_response_with_tool_use() {
        let api_response = ApiResponse {
            content: vec![
                ApiContentBlock::Text {
                    text: "Looking now".to_string(),
                },
                ApiContentBlock::ToolUse {
                    id: "toolu_1".to_string(),
                    name: "grep_search".to_string(),
                    input: serde_json::json!({"pattern": "Foo"}),
                },
            ],
            stop_reason: "tool_use".to_string(),
            usage: ApiUsage {
                input_tokens: 120,
                output_tokens: 30,
                cache_read_input_tokens: None,
                cache_creation_input_tokens: None,
            },
            model: "claude-sonnet-4-5".to_string(),
        };

        let response = client().parse_response(api_response);
        assert_eq!(response.content.as_deref(), Some("Looking now"));
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.stop_reason, StopReason::ToolUse);
        assert_eq!(response.usage.total(), 150);
    }
}
