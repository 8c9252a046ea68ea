//! Cross-iteration progress and search-signal tracking

mod search;
mod tracker;

pub use search::{
    PREVIEW_CHARS, SearchAssessment, SearchSignal, SearchSignalTracker, assess_with_llm, heuristic_classify,
    looks_like_discovery,
};
pub use tracker::{ProgressInputs, ProgressTracker};
