//! Budget controller
//!
//! Derives the iteration budget from the classifier (clamped), the token
//! budget from quality-filtered history percentiles, and grants additive
//! extensions near the end of the run while progress holds.

use tracing::{debug, info, warn};

use crate::progress::{ProgressTracker, SearchSignalTracker};

/// Iteration budgets never drop below this.
const MIN_ITERATION_BUDGET: u32 = 4;

/// Hard ceiling on the classifier-derived budget.
const MAX_ITERATION_BUDGET: u32 = 20;

/// Extension fires when this many iterations (or fewer) remain.
const EXTEND_WHEN_REMAINING: u32 = 2;

/// Recency windows for the extension predicate.
const SIGNAL_RECENCY: u32 = 3;
const PROGRESS_RECENCY: u32 = 2;

/// Budget state for one run.
#[derive(Debug)]
pub struct BudgetController {
    config_max: u32,
    fallback_budget: u32,
    extension_step: u32,
    warn_after: u32,
    extensions_granted: u32,
}

impl BudgetController {
    pub fn new(config_max: u32, fallback_budget: u32, extension_step: u32, warn_after: u32) -> Self {
        Self {
            config_max,
            fallback_budget,
            extension_step,
            warn_after,
            extensions_granted: 0,
        }
    }

    /// Iteration budget from the classifier's suggestion, clamped to
    /// `[4, min(config_max, 20)]`. `None` means the classifier failed.
    pub fn initial_iteration_budget(&self, classifier_budget: Option<u32>) -> u32 {
        let ceiling = self.config_max.min(MAX_ITERATION_BUDGET);
        let budget = match classifier_budget {
            Some(b) => b.clamp(MIN_ITERATION_BUDGET, ceiling),
            None => self.fallback_budget.min(ceiling),
        };
        debug!(?classifier_budget, budget, "BudgetController::initial_iteration_budget");
        budget
    }

    /// Token budget: `max(p75, p90 * 0.8)` over token usage of past runs
    /// that met the quality floor. Disabled (0) below 5 samples.
    pub fn token_budget(&self, quality_filtered_tokens: &[u64], min_samples: usize) -> u64 {
        if quality_filtered_tokens.len() < min_samples {
            return 0;
        }
        let p75 = percentile(quality_filtered_tokens, 0.75);
        let p90 = percentile(quality_filtered_tokens, 0.90);
        let budget = p75.max((p90 as f64 * 0.8) as u64);
        debug!(p75, p90, budget, "BudgetController::token_budget");
        budget
    }

    /// Grant `current + step` when the run is near its end and still moving:
    /// not stalled, or a search signal within 3 iterations, or progress
    /// within 2. Unbounded in count; each grant is logged.
    pub fn maybe_extend(
        &mut self,
        current_budget: u32,
        iteration: u32,
        tracker: &ProgressTracker,
        search: &SearchSignalTracker,
    ) -> Option<u32> {
        let remaining = current_budget.saturating_sub(iteration);
        if remaining > EXTEND_WHEN_REMAINING {
            return None;
        }

        let progress_recent =
            tracker.last_progress_iteration() > 0 && iteration - tracker.last_progress_iteration() <= PROGRESS_RECENCY;
        let moving = !tracker.is_stuck() || search.signal_within(iteration, SIGNAL_RECENCY) || progress_recent;
        if !moving {
            return None;
        }

        self.extensions_granted += 1;
        let extended = current_budget + self.extension_step;
        info!(
            iteration,
            extended,
            extensions = self.extensions_granted,
            "iteration budget extended"
        );
        if self.extensions_granted > self.warn_after {
            warn!(
                extensions = self.extensions_granted,
                "budget extensions exceed the expected ceiling; possible runaway run"
            );
        }
        Some(extended)
    }

    pub fn extensions_granted(&self) -> u32 {
        self.extensions_granted
    }
}

/// Nearest-rank percentile.
fn percentile(values: &[u64], q: f64) -> u64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let rank = ((q * sorted.len() as f64).ceil() as usize).max(1);
    sorted[rank - 1]
}
