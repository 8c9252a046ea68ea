//! Progress tracking - the stall signal
//!
//! Scores each iteration from tool diversity, output growth, evidence delta,
//! search signal delta and failure trend. Strong iterations reset the stall
//! counter, weak ones decay it, empty ones grow it.

use std::collections::VecDeque;

use tracing::debug;

/// Ring length for recent tool names and output sizes.
const RING_LEN: usize = 3;

/// Output growth that counts as progress on its own.
const GROWTH_FLOOR: i64 = 300;
const GROWTH_RATIO: f64 = 1.35;

/// Per-iteration observations fed into the tracker.
#[derive(Debug, Clone, Copy)]
pub struct ProgressInputs {
    pub iteration: u32,
    /// New evidence items (files read/modified/created) this iteration.
    pub evidence_delta: u32,
    pub failed_tools_this_iteration: u32,
    /// Cumulative search signal hits after this iteration's assessment.
    pub search_signal_hits: u32,
}

/// The progress state for one run.
#[derive(Debug)]
pub struct ProgressTracker {
    recent_tools: VecDeque<String>,
    recent_output_sizes: VecDeque<usize>,
    iterations_since_progress: u32,
    last_progress_iteration: u32,
    last_failure_count: u32,
    last_search_signal_hits: u32,
    stuck_threshold: u32,
}

impl ProgressTracker {
    pub fn new(stuck_threshold: u32) -> Self {
        Self {
            recent_tools: VecDeque::with_capacity(RING_LEN),
            recent_output_sizes: VecDeque::with_capacity(RING_LEN),
            iterations_since_progress: 0,
            last_progress_iteration: 0,
            last_failure_count: 0,
            last_search_signal_hits: 0,
            stuck_threshold,
        }
    }

    /// Update once per iteration with the dominant tool and its output size.
    /// Returns the iteration's progress score.
    pub fn update(&mut self, tool_name: &str, output_size: usize, inputs: &ProgressInputs) -> u32 {
        let previous = self.recent_output_sizes.back().copied().unwrap_or(0);
        let output_growth = output_size as i64 - previous as i64;
        let output_growth_ratio = if previous > 0 {
            output_size as f64 / previous as f64
        } else if output_size > 0 {
            1.0
        } else {
            0.0
        };

        let search_signal_delta = inputs.search_signal_hits.saturating_sub(self.last_search_signal_hits);
        let errors_decreased = self.last_failure_count > inputs.failed_tools_this_iteration;

        push_ring(&mut self.recent_tools, tool_name.to_string());
        push_ring(&mut self.recent_output_sizes, output_size);

        let repeated_single = self.repeated_single_tool();
        let diverse = !repeated_single && self.has_diverse_recent_tools();

        let mut score = 0u32;
        if inputs.evidence_delta > 0 {
            score += 3;
        }
        if search_signal_delta > 0 {
            score += 2;
        }
        if errors_decreased {
            score += 2;
        }
        if output_growth >= GROWTH_FLOOR || output_growth_ratio >= GROWTH_RATIO {
            score += 1;
        }
        if diverse {
            score += 1;
        }

        if score >= 2 {
            self.iterations_since_progress = 0;
            self.last_progress_iteration = inputs.iteration;
        } else if score == 1 {
            self.iterations_since_progress = self.iterations_since_progress.saturating_sub(1);
        } else {
            self.iterations_since_progress += 1;
        }

        self.last_failure_count = inputs.failed_tools_this_iteration;
        self.last_search_signal_hits = inputs.search_signal_hits;

        debug!(
            iteration = inputs.iteration,
            score,
            since_progress = self.iterations_since_progress,
            repeated_single,
            "ProgressTracker::update"
        );
        score
    }

    /// The last three recorded tools are one and the same.
    pub fn repeated_single_tool(&self) -> bool {
        self.recent_tools.len() == RING_LEN && self.recent_tools.iter().all(|t| t == &self.recent_tools[0])
    }

    fn has_diverse_recent_tools(&self) -> bool {
        if self.recent_tools.len() < 2 {
            return false;
        }
        let mut names: Vec<&str> = self.recent_tools.iter().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names.len() >= 2
    }

    /// Stall predicate.
    pub fn is_stuck(&self) -> bool {
        self.repeated_single_tool() || self.iterations_since_progress >= self.stuck_threshold
    }

    /// One step short of the stall threshold.
    pub fn near_stuck(&self) -> bool {
        self.iterations_since_progress + 1 >= self.stuck_threshold
    }

    pub fn iterations_since_progress(&self) -> u32 {
        self.iterations_since_progress
    }

    pub fn last_progress_iteration(&self) -> u32 {
        self.last_progress_iteration
    }
}

fn push_ring<T>(ring: &mut VecDeque<T>, value: T) {
    if ring.len() == RING_LEN {
        ring.pop_front();
    }
    ring.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(iteration: u32, evidence_delta: u32, failed: u32, hits: u32) -> ProgressInputs {
        ProgressInputs {
            iteration,
            evidence_delta,
            failed_tools_this_iteration: failed,
            search_signal_hits: hits,
        }
    }

    #[test]
    fn test_evidence_resets_stall_counter() {
        let mut tracker = ProgressTracker::new(3);
        tracker.update("grep_search", 0, &inputs(1, 0, 0, 0));
        tracker.update("grep_search", 0, &inputs(2, 0, 0, 0));
        assert_eq!(tracker.iterations_since_progress(), 2);

        let score = tracker.update("fs_read", 100, &inputs(3, 1, 0, 0));
        assert!(score >= 3);
        assert_eq!(tracker.iterations_since_progress(), 0);
        assert_eq!(tracker.last_progress_iteration(), 3);
    }

    #[test]
    fn test_search_signal_delta_scores() {
        let mut tracker = ProgressTracker::new(3);
        let score = tracker.update("grep_search", 10, &inputs(1, 0, 0, 1));
        // +2 signal delta, no previous size so no growth point
        assert_eq!(score, 2);
    }

    #[test]
    fn test_error_decrease_scores() {
        let mut tracker = ProgressTracker::new(3);
        tracker.update("shell_exec", 10, &inputs(1, 0, 2, 0));
        // errors went from 2 to 0: +2
        let score = tracker.update("shell_exec", 10, &inputs(2, 0, 0, 0));
        assert_eq!(score, 2);
        assert_eq!(tracker.iterations_since_progress(), 0);
    }

    #[test]
    fn test_output_growth_decays_counter() {
        let mut tracker = ProgressTracker::new(3);
        tracker.update("grep_search", 100, &inputs(1, 0, 0, 0));
        tracker.update("grep_search", 100, &inputs(2, 0, 0, 0));
        assert_eq!(tracker.iterations_since_progress(), 2);

        // Growth of 400 chars alone scores 1: decay, not reset
        tracker.update("grep_search", 500, &inputs(3, 0, 0, 0));
        assert_eq!(tracker.iterations_since_progress(), 1);
    }

    #[test]
    fn test_repeated_single_tool_is_stuck() {
        let mut tracker = ProgressTracker::new(3);
        // Same tool, flat output, no signals
        tracker.update("grep_search", 10, &inputs(1, 0, 0, 0));
        tracker.update("grep_search", 10, &inputs(2, 0, 0, 0));
        assert!(!tracker.repeated_single_tool());
        tracker.update("grep_search", 10, &inputs(3, 0, 0, 0));
        assert!(tracker.repeated_single_tool());
        assert!(tracker.is_stuck());
    }

    #[test]
    fn test_diversity_bonus_avoids_stuck() {
        let mut tracker = ProgressTracker::new(3);
        tracker.update("grep_search", 10, &inputs(1, 0, 0, 0));
        // Different tool with flat output still decays via diversity point
        tracker.update("fs_list", 10, &inputs(2, 0, 0, 0));
        assert_eq!(tracker.iterations_since_progress(), 0);
        assert!(!tracker.is_stuck());
    }

    #[test]
    fn test_stall_counter_reaches_threshold() {
        let mut tracker = ProgressTracker::new(3);
        for i in 1..=3 {
            tracker.update("grep_search", 0, &inputs(i, 0, 0, 0));
        }
        assert!(tracker.is_stuck());
        assert_eq!(tracker.iterations_since_progress(), 3);
    }
}
