//! The iteration loop and its collaborators
//!
//! The engine runs: build lean context → LLM with tools → execute tool
//! calls → update trackers and memory → check convergence and escalation →
//! repeat, bounded by the iteration and token budgets. Termination always
//! passes through the quality gate.

mod budget;
mod classify;
mod context;
mod engine;
mod escalate;
mod metrics;
mod quality;
mod reflect;
mod todo;
mod validate;

pub use budget::BudgetController;
pub use classify::{Classification, classify_task};
pub use context::{BuiltContext, ContextBuilder, ContextInputs};
pub use engine::{AgentEngine, ParentLink};
pub use escalate::{
    AuxContext, AuxNode, EscalationInputs, EscalationSignal, choose_smart_tier, evaluate_escalation_need,
};
pub use metrics::RunKpis;
pub use quality::{
    QualityInputs, QualityReport, QualityStatus, evaluate as evaluate_quality, has_strong_evidence_signal,
    looks_multi_step,
};
pub use reflect::{Reflection, ReflectionEngine, ReflectionTrigger};
pub use todo::TodoCoordinator;
pub use validate::{ValidationInputs, ValidationOutcome};
