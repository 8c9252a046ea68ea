//! LlmClient trait definition

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, LlmError};

/// Stateless LLM client - each call is independent.
///
/// The engine rebuilds the message list for every call (lean context), so no
/// conversation state lives in the client. Tool use, forced tool choice and
/// plain completions all go through the one `chat` method; the request's
/// `tools` / `tool_choice` fields select the mode.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Send a single chat request (blocking until complete).
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

/// Convenience wrapper for auxiliary text-in/text-out calls.
pub async fn complete_text(
    llm: &dyn LlmClient,
    model: &str,
    system_prompt: &str,
    user: &str,
) -> Result<String, LlmError> {
    let response = llm.chat(ChatRequest::completion(model, system_prompt, user)).await?;
    response
        .content
        .ok_or_else(|| LlmError::InvalidResponse("empty completion".to_string()))
}

pub mod mock {
    //! Scripted client for tests and embedding harnesses.
    //!
    //! Main-loop calls (tool_choice auto/none) pop from a response queue in
    //! order. Forced-tool calls (classifier, search assessment, reflection,
    //! validation) are served from a per-tool-name script and error out when
    //! nothing is registered, which exercises the engine's heuristic
    //! fallbacks deterministically.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use tracing::debug;

    use super::*;
    use crate::llm::ToolChoice;

    /// Mock LLM client with scripted responses.
    pub struct MockLlmClient {
        queue: Mutex<VecDeque<ChatResponse>>,
        forced: Mutex<HashMap<String, VecDeque<ChatResponse>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl MockLlmClient {
        pub fn new(responses: Vec<ChatResponse>) -> Self {
            debug!(response_count = responses.len(), "MockLlmClient::new: called");
            Self {
                queue: Mutex::new(responses.into()),
                forced: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Register a response for the next forced call of `tool_name`.
        pub fn on_forced_tool(self, tool_name: impl Into<String>, response: ChatResponse) -> Self {
            self.forced
                .lock()
                .expect("forced map poisoned")
                .entry(tool_name.into())
                .or_default()
                .push_back(response);
            self
        }

        /// Number of chat calls served so far.
        pub fn call_count(&self) -> usize {
            self.requests.lock().expect("requests poisoned").len()
        }

        /// Snapshot of every request seen, in order.
        pub fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().expect("requests poisoned").clone()
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
            let choice = request.tool_choice.clone();
            self.requests.lock().expect("requests poisoned").push(request);

            if let ToolChoice::Tool(name) = choice {
                debug!(%name, "MockLlmClient::chat: forced tool call");
                return self
                    .forced
                    .lock()
                    .expect("forced map poisoned")
                    .get_mut(&name)
                    .and_then(|q| q.pop_front())
                    .ok_or_else(|| LlmError::InvalidResponse(format!("no scripted response for forced tool {name}")));
            }

            self.queue
                .lock()
                .expect("queue poisoned")
                .pop_front()
                .ok_or_else(|| LlmError::InvalidResponse("No more mock responses".to_string()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_client_pops_in_order() {
            let client = MockLlmClient::new(vec![ChatResponse::text("one"), ChatResponse::text("two")]);

            let req = ChatRequest::completion("m", "sys", "hi");
            assert_eq!(client.chat(req.clone()).await.unwrap().content.as_deref(), Some("one"));
            assert_eq!(client.chat(req).await.unwrap().content.as_deref(), Some("two"));
            assert_eq!(client.call_count(), 2);
        }

        #[tokio::test]
        async fn test_mock_client_forced_tool_routing() {
            let client = MockLlmClient::new(vec![]).on_forced_tool(
                "set_classification",
                ChatResponse::tool_use("c1", "set_classification", serde_json::json!({"intent": "action"})),
            );

            let mut req = ChatRequest::completion("m", "sys", "hi");
            req.tool_choice = ToolChoice::Tool("set_classification".to_string());
            let resp = client.chat(req.clone()).await.unwrap();
            assert_eq!(resp.tool_calls[0].name, "set_classification");

            // Exhausted script errors out
            assert!(client.chat(req).await.is_err());
        }

        #[tokio::test]
        async fn test_mock_client_errors_when_exhausted() {
            let client = MockLlmClient::new(vec![]);
            let result = client.chat(ChatRequest::completion("m", "sys", "hi")).await;
            assert!(result.is_err());
        }
    }
}
