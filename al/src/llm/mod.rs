//! LLM client module
//!
//! Provides the provider-agnostic client trait, request/response types,
//! the tier model, and the Anthropic implementation.

mod anthropic;
pub mod client;
mod error;
mod tier;
mod types;

pub use anthropic::AnthropicClient;
pub use client::{LlmClient, complete_text};
pub use error::LlmError;
pub use tier::{Tier, TierModels};
pub use types::{
    ChatRequest, ChatResponse, ContentBlock, Message, MessageContent, Role, StopReason, TokenUsage, ToolCall,
    ToolChoice, ToolDefinition,
};
