//! Event types for agent activity streaming and tracing
//!
//! Two vocabularies, both closed:
//! - [`AgentEventKind`]: the lifecycle events delivered to run observers
//!   (start/end pairs correlated by `tool_call_id` or `started_at`)
//! - [`TraceKind`]: the diagnostic trace vocabulary consumed by tracer sinks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::Tier;

/// An observable event, enriched with run identity and a per-run sequence
/// number. Sequence numbers are strictly monotonic within a run, across
/// events and traces alike.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub seq: u64,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_agent_id: Option<String>,
    #[serde(rename = "ts")]
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AgentEventKind,
}

/// The lifecycle event vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AgentEventKind {
    #[serde(rename = "agent:start")]
    AgentStart {
        task: String,
        tier: Tier,
        started_at: DateTime<Utc>,
    },
    #[serde(rename = "agent:end")]
    AgentEnd {
        stopped: bool,
        success: bool,
        iterations: u32,
        started_at: DateTime<Utc>,
    },
    #[serde(rename = "agent:error")]
    AgentError { message: String },

    #[serde(rename = "iteration:start")]
    IterationStart {
        iteration: u32,
        started_at: DateTime<Utc>,
    },
    #[serde(rename = "iteration:end")]
    IterationEnd {
        iteration: u32,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        tool_calls: usize,
    },

    #[serde(rename = "llm:start")]
    LlmStart {
        iteration: u32,
        model: String,
        started_at: DateTime<Utc>,
    },
    #[serde(rename = "llm:end")]
    LlmEnd {
        iteration: u32,
        model: String,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        input_tokens: u64,
        output_tokens: u64,
    },

    #[serde(rename = "tool:start")]
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        iteration: u32,
        started_at: DateTime<Utc>,
    },
    #[serde(rename = "tool:end")]
    ToolEnd {
        tool_call_id: String,
        tool_name: String,
        iteration: u32,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        success: bool,
    },
    #[serde(rename = "tool:error")]
    ToolError {
        tool_call_id: String,
        tool_name: String,
        iteration: u32,
        started_at: DateTime<Utc>,
        duration_ms: u64,
        error: String,
    },

    #[serde(rename = "status:change")]
    StatusChange { status: String, detail: String },

    #[serde(rename = "subtask:start")]
    SubtaskStart { subtask_id: String, task: String },
    #[serde(rename = "subtask:end")]
    SubtaskEnd { subtask_id: String, success: bool },

    #[serde(rename = "synthesis:forced")]
    SynthesisForced { reason: String },
    #[serde(rename = "synthesis:start")]
    SynthesisStart { iteration: u32 },
    #[serde(rename = "synthesis:complete")]
    SynthesisComplete { iteration: u32, chars: usize },
}

impl AgentEventKind {
    /// Wire name of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEventKind::AgentStart { .. } => "agent:start",
            AgentEventKind::AgentEnd { .. } => "agent:end",
            AgentEventKind::AgentError { .. } => "agent:error",
            AgentEventKind::IterationStart { .. } => "iteration:start",
            AgentEventKind::IterationEnd { .. } => "iteration:end",
            AgentEventKind::LlmStart { .. } => "llm:start",
            AgentEventKind::LlmEnd { .. } => "llm:end",
            AgentEventKind::ToolStart { .. } => "tool:start",
            AgentEventKind::ToolEnd { .. } => "tool:end",
            AgentEventKind::ToolError { .. } => "tool:error",
            AgentEventKind::StatusChange { .. } => "status:change",
            AgentEventKind::SubtaskStart { .. } => "subtask:start",
            AgentEventKind::SubtaskEnd { .. } => "subtask:end",
            AgentEventKind::SynthesisForced { .. } => "synthesis:forced",
            AgentEventKind::SynthesisStart { .. } => "synthesis:start",
            AgentEventKind::SynthesisComplete { .. } => "synthesis:complete",
        }
    }
}

/// The closed trace vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceKind {
    #[serde(rename = "task:start")]
    TaskStart,
    #[serde(rename = "task:end")]
    TaskEnd,
    #[serde(rename = "iteration:detail")]
    IterationDetail,
    #[serde(rename = "llm:call")]
    LlmCall,
    #[serde(rename = "llm:validation")]
    LlmValidation,
    #[serde(rename = "stopping:analysis")]
    StoppingAnalysis,
    #[serde(rename = "tool:execution")]
    ToolExecution,
    #[serde(rename = "tool:filter")]
    ToolFilter,
    #[serde(rename = "context:snapshot")]
    ContextSnapshot,
    #[serde(rename = "context:diff")]
    ContextDiff,
    #[serde(rename = "context:trim")]
    ContextTrim,
    #[serde(rename = "memory:snapshot")]
    MemorySnapshot,
    #[serde(rename = "synthesis:forced")]
    SynthesisForced,
    #[serde(rename = "error:captured")]
    ErrorCaptured,
    #[serde(rename = "fact:added")]
    FactAdded,
    #[serde(rename = "archive:store")]
    ArchiveStore,
    #[serde(rename = "summarization:result")]
    SummarizationResult,
    #[serde(rename = "summarization:llm_call")]
    SummarizationLlmCall,
}

/// One trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub seq: u64,
    #[serde(rename = "ts")]
    pub at: DateTime<Utc>,
    pub kind: TraceKind,
    pub data: serde_json::Value,
}
