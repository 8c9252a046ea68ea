//! Tool registry trait and result types
//!
//! The engine never implements tools; it consumes a registry. Concrete
//! registries (filesystem, search, shell) live with the embedding
//! application. Tests use a scripted registry.

use async_trait::async_trait;
use serde_json::Value;

use super::context::ToolContext;
use crate::llm::ToolDefinition;

/// Structured error details a tool may attach to a failure.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

/// Result of a tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
    pub details: Option<ErrorDetails>,
    pub metadata: Option<Value>,
}

impl ToolResult {
    /// Create a successful result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Default::default()
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    /// Error result with structured details.
    pub fn error_with(message: impl Into<String>, code: impl Into<String>, retryable: bool, hint: Option<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            details: Some(ErrorDetails {
                code: code.into(),
                retryable,
                hint,
            }),
            ..Default::default()
        }
    }

    /// Text fed back to the model (output on success, error otherwise).
    pub fn content(&self) -> &str {
        if self.success {
            self.output.as_deref().unwrap_or("")
        } else {
            self.error.as_deref().unwrap_or("tool failed")
        }
    }
}

/// Registry of tools available to a run.
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    /// Definitions advertised to the LLM.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a tool by name with normalized input.
    async fn execute(&self, name: &str, input: Value, ctx: &ToolContext) -> ToolResult;

    /// Check if a tool exists
    fn has_tool(&self, name: &str) -> bool {
        self.definitions().iter().any(|d| d.name == name)
    }
}
