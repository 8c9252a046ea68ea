//! Engine configuration types and loading

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::llm::{Tier, TierModels};

/// Configuration for the execution engine (from YAML).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound for the classifier-derived iteration budget.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Budget used when the classifier call fails.
    #[serde(default = "default_fallback_budget")]
    pub fallback_budget: u32,

    /// Iterations added per budget extension.
    #[serde(default = "default_budget_extension_step")]
    pub budget_extension_step: u32,

    /// Extensions beyond this count are logged as runaway suspects.
    #[serde(default = "default_extension_warn_after")]
    pub extension_warn_after: u32,

    /// Iterations without progress before a run counts as stuck.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,

    /// Messages of full history replayed into the lean context.
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,

    /// Background summarization fires every N iterations.
    #[serde(default = "default_summarization_interval")]
    pub summarization_interval: u32,

    /// Tool output inserted into the conversation is truncated to this.
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,

    /// Minimum final-text length for the informational fast path.
    #[serde(default = "default_min_informational_response_chars")]
    pub min_informational_response_chars: usize,

    /// Heuristic facts below this confidence are discarded.
    #[serde(default = "default_auto_fact_min_confidence")]
    pub auto_fact_min_confidence: f64,

    /// Main-loop tier escalation on stall.
    #[serde(default = "default_escalation_enabled")]
    pub escalation_enabled: bool,

    /// Quality floor for runs contributing to the token budget.
    #[serde(default = "default_token_budget_min_quality")]
    pub token_budget_min_quality: f64,

    /// Token budget stays disabled below this many historical samples.
    #[serde(default = "default_token_budget_min_samples")]
    pub token_budget_min_samples: usize,

    /// Fraction of the token budget that arms cost-aware tool restriction.
    #[serde(default = "default_cost_aware_token_threshold")]
    pub cost_aware_token_threshold: f64,

    /// Earliest iteration at which a no-result conclusion may fire.
    #[serde(default = "default_min_iterations_before_conclusion")]
    pub min_iterations_before_conclusion: u32,

    /// Consecutive no-signal search iterations required per tier.
    #[serde(default)]
    pub no_signal_limits: NoSignalLimits,

    #[serde(default)]
    pub fact_sheet: FactSheetConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub guard: GuardConfig,

    /// Tier-to-model mapping.
    #[serde(default)]
    pub tiers: TierModels,

    /// Max tokens per LLM response.
    #[serde(default = "default_llm_max_tokens")]
    pub llm_max_tokens: u32,
}

/// Per-tier limits for the no-result early conclusion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoSignalLimits {
    #[serde(default = "default_no_signal_small")]
    pub small: u32,
    #[serde(default = "default_no_signal_medium")]
    pub medium: u32,
    #[serde(default = "default_no_signal_large")]
    pub large: u32,
}

impl NoSignalLimits {
    pub fn for_tier(&self, tier: Tier) -> u32 {
        match tier {
            Tier::Small => self.small,
            Tier::Medium => self.medium,
            Tier::Large => self.large,
        }
    }
}

/// Hot-memory caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactSheetConfig {
    /// Estimated-token cap for the whole sheet.
    #[serde(default = "default_fact_sheet_max_tokens")]
    pub max_tokens: usize,

    /// Cap on entries within one category.
    #[serde(default = "default_fact_sheet_max_per_category")]
    pub max_entries_per_category: usize,

    /// Normalized-similarity threshold for merging near-duplicates.
    #[serde(default = "default_fact_merge_similarity")]
    pub merge_similarity: f64,
}

/// Cold-memory caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_archive_max_total_chars")]
    pub max_total_chars: usize,
}

/// Pre-dispatch guard limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Reads below this many lines count as small windows.
    #[serde(default = "default_min_read_window_lines")]
    pub min_read_window_lines: u32,

    /// Small-window reads tolerated per file before rejection.
    #[serde(default = "default_max_small_window_reads")]
    pub max_consecutive_small_window_reads_per_file: u32,
}

fn default_max_iterations() -> u32 {
    20
}

fn default_fallback_budget() -> u32 {
    12
}

fn default_budget_extension_step() -> u32 {
    5
}

fn default_extension_warn_after() -> u32 {
    5
}

fn default_stuck_threshold() -> u32 {
    3
}

fn default_sliding_window_size() -> usize {
    20
}

fn default_summarization_interval() -> u32 {
    5
}

fn default_max_tool_output_chars() -> usize {
    8000
}

fn default_min_informational_response_chars() -> usize {
    280
}

fn default_auto_fact_min_confidence() -> f64 {
    0.5
}

fn default_escalation_enabled() -> bool {
    true
}

fn default_token_budget_min_quality() -> f64 {
    0.75
}

fn default_token_budget_min_samples() -> usize {
    5
}

fn default_cost_aware_token_threshold() -> f64 {
    0.9
}

fn default_min_iterations_before_conclusion() -> u32 {
    3
}

fn default_no_signal_small() -> u32 {
    3
}

fn default_no_signal_medium() -> u32 {
    4
}

fn default_no_signal_large() -> u32 {
    5
}

fn default_fact_sheet_max_tokens() -> usize {
    1200
}

fn default_fact_sheet_max_per_category() -> usize {
    6
}

fn default_fact_merge_similarity() -> f64 {
    0.72
}

fn default_archive_max_entries() -> usize {
    200
}

fn default_archive_max_total_chars() -> usize {
    400_000
}

fn default_min_read_window_lines() -> u32 {
    40
}

fn default_max_small_window_reads() -> u32 {
    3
}

fn default_llm_max_tokens() -> u32 {
    8192
}

impl Default for NoSignalLimits {
    fn default() -> Self {
        Self {
            small: default_no_signal_small(),
            medium: default_no_signal_medium(),
            large: default_no_signal_large(),
        }
    }
}

impl Default for FactSheetConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_fact_sheet_max_tokens(),
            max_entries_per_category: default_fact_sheet_max_per_category(),
            merge_similarity: default_fact_merge_similarity(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_entries: default_archive_max_entries(),
            max_total_chars: default_archive_max_total_chars(),
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_read_window_lines: default_min_read_window_lines(),
            max_consecutive_small_window_reads_per_file: default_max_small_window_reads(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        // Round-trips through serde so field defaults stay the single source
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl EngineConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "EngineConfig::from_yaml_file");
        let text = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&text)?)
    }
}
