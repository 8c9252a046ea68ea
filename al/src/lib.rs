//! agentloop - bounded execution engine for autonomous LLM agents
//!
//! agentloop drives a large-language-model to complete one user task by
//! invoking tools and synthesizing a final answer, inside a bounded,
//! observable, self-correcting loop. The engine owns budgeting (iterations
//! and tokens), tier escalation on stagnation, progress and stall
//! detection, two-tier working memory (fact sheet + archive), reflection
//! checkpoints, quality-gated completion and structured telemetry.
//!
//! # Core Concepts
//!
//! - **Bounded Always**: the iteration budget is the only hard bound;
//!   extensions are additive and each one is logged
//! - **Lean Context**: the model sees a sliding window plus distilled
//!   facts, never the raw full history
//! - **Evidence over Claims**: completion passes a validator and a quality
//!   gate scored on gathered evidence
//! - **Escalate on Stall**: a stuck run retries at the next model tier up
//!
//! # Modules
//!
//! - [`llm`] - client trait, tiers, and the Anthropic implementation
//! - [`tools`] - registry trait, input normalization, guard rules
//! - [`memory`] - hot fact sheet and cold archive
//! - [`progress`] - stall scoring and search-signal tracking
//! - [`r#loop`] - the orchestrator and its collaborators
//! - [`events`] - event bus, trace vocabulary, sinks
//! - [`config`] - engine tunables
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod llm;
pub mod memory;
pub mod progress;
pub mod prompts;
pub mod tools;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use config::{ArchiveConfig, EngineConfig, FactSheetConfig, GuardConfig, NoSignalLimits};
pub use domain::{ExecutionPhase, Intent, LedgerStep, PhaseTracker, RunSpec, StepStatus, TaskLedger, TaskResult};
pub use events::{
    AgentEvent, AgentEventKind, Analytics, EventBus, EventEmitter, NullAnalytics, NullTracer, TraceEvent, TraceKind,
    Tracer,
};
pub use llm::{
    AnthropicClient, ChatRequest, ChatResponse, LlmClient, LlmError, Message, Tier, TierModels, ToolCall,
    ToolDefinition,
};
pub use memory::{Archive, ArchiveEntry, FactEntry, FactSheet, LongTermMemory, NewFact};
pub use progress::{ProgressTracker, SearchSignal, SearchSignalTracker};
pub use r#loop::{AgentEngine, BudgetController, EscalationSignal, ParentLink, QualityStatus, RunKpis};
pub use tools::{
    AgentSpawner, FileChange, FileChangeTracker, GuardError, ReadWindowPlanner, ToolContext, ToolGuard, ToolRegistry,
    ToolResult,
};
