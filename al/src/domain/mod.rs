//! Core domain types: run specs, results, ledger, phases, id generation

pub mod id;
mod ledger;
mod phase;
mod run;

pub use ledger::{LedgerStep, StepStatus, TaskLedger, capability_of};
pub use phase::{ExecutionPhase, PhaseDuration, PhaseTracker};
pub use run::{Intent, RunSpec, TaskResult};
