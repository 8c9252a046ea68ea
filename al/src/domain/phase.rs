//! Execution phases
//!
//! Phases advance forward (skipping is allowed); the only sanctioned
//! backtrack is `Converging -> Executing`. `Failed` is reachable from
//! anywhere. Durations are recorded for telemetry.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Scoping,
    PlanningLite,
    Executing,
    Converging,
    Verifying,
    Reporting,
    Completed,
    Failed,
}

impl ExecutionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionPhase::Scoping => "scoping",
            ExecutionPhase::PlanningLite => "planning_lite",
            ExecutionPhase::Executing => "executing",
            ExecutionPhase::Converging => "converging",
            ExecutionPhase::Verifying => "verifying",
            ExecutionPhase::Reporting => "reporting",
            ExecutionPhase::Completed => "completed",
            ExecutionPhase::Failed => "failed",
        }
    }

    fn order(self) -> u8 {
        match self {
            ExecutionPhase::Scoping => 0,
            ExecutionPhase::PlanningLite => 1,
            ExecutionPhase::Executing => 2,
            ExecutionPhase::Converging => 3,
            ExecutionPhase::Verifying => 4,
            ExecutionPhase::Reporting => 5,
            ExecutionPhase::Completed => 6,
            ExecutionPhase::Failed => 7,
        }
    }
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time spent in one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDuration {
    pub phase: ExecutionPhase,
    pub duration_ms: u64,
}

/// Tracks the current phase and how long each phase lasted.
#[derive(Debug)]
pub struct PhaseTracker {
    current: ExecutionPhase,
    entered_at: Instant,
    durations: Vec<PhaseDuration>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            current: ExecutionPhase::Scoping,
            entered_at: Instant::now(),
            durations: Vec::new(),
        }
    }

    pub fn current(&self) -> ExecutionPhase {
        self.current
    }

    /// Attempt a transition. Illegal transitions are rejected (and logged),
    /// leaving the tracker unchanged.
    pub fn transition(&mut self, to: ExecutionPhase) -> bool {
        if !Self::allowed(self.current, to) {
            warn!(from = %self.current, to = %to, "PhaseTracker::transition: rejected");
            return false;
        }
        self.durations.push(PhaseDuration {
            phase: self.current,
            duration_ms: self.entered_at.elapsed().as_millis() as u64,
        });
        self.current = to;
        self.entered_at = Instant::now();
        true
    }

    fn allowed(from: ExecutionPhase, to: ExecutionPhase) -> bool {
        if from == to {
            return false;
        }
        if to == ExecutionPhase::Failed {
            return true;
        }
        // The one sanctioned backtrack
        if from == ExecutionPhase::Converging && to == ExecutionPhase::Executing {
            return true;
        }
        to.order() > from.order()
    }

    /// Recorded durations of all phases left so far.
    pub fn durations(&self) -> &[PhaseDuration] {
        &self.durations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.transition(ExecutionPhase::PlanningLite));
        assert!(tracker.transition(ExecutionPhase::Executing));
        assert!(tracker.transition(ExecutionPhase::Converging));
        assert!(tracker.transition(ExecutionPhase::Verifying));
        assert!(tracker.transition(ExecutionPhase::Reporting));
        assert!(tracker.transition(ExecutionPhase::Completed));
        assert_eq!(tracker.durations().len(), 6);
    }

    #[test]
    fn test_skipping_forward_is_allowed() {
        let mut tracker = PhaseTracker::new();
        assert!(tracker.transition(ExecutionPhase::Executing));
        assert!(tracker.transition(ExecutionPhase::Reporting));
    }

    #[test]
    fn test_converging_backtrack() {
        let mut tracker = PhaseTracker::new();
        tracker.transition(ExecutionPhase::Executing);
        tracker.transition(ExecutionPhase::Converging);
        assert!(tracker.transition(ExecutionPhase::Executing));
    }

    #[test]
    fn test_other_backtracks_rejected() {
        let mut tracker = PhaseTracker::new();
        tracker.transition(ExecutionPhase::Verifying);
        assert!(!tracker.transition(ExecutionPhase::Executing));
        assert_eq!(tracker.current(), ExecutionPhase::Verifying);
    }

    #[test]
    fn test_failed_reachable_from_anywhere() {
        let mut tracker = PhaseTracker::new();
        tracker.transition(ExecutionPhase::Executing);
        assert!(tracker.transition(ExecutionPhase::Failed));
    }
}
