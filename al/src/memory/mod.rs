//! Two-tier working memory
//!
//! - [`FactSheet`]: hot tier, small and deduplicated, injected into every
//!   system prompt
//! - [`Archive`]: cold tier, full tool outputs with recall indexes
//! - heuristic extraction feeds the hot tier after every tool call; the
//!   background summarizer adds higher-quality facts asynchronously

mod archive;
mod extract;
mod fact_sheet;
pub mod long_term;
mod summarizer;

pub use archive::{Archive, ArchiveEntry, StoreOutcome};
pub use extract::extract_facts;
pub use fact_sheet::{AddOutcome, FactEntry, FactSheet, NewFact};
pub use long_term::LongTermMemory;
pub use summarizer::spawn_summarization;
