//! Tier selection and escalation
//!
//! Auxiliary calls pick a tier per call (default small, biased to medium on
//! specific smells). The main loop escalates to the next tier up when a run
//! is stalled with nothing recent to show for it.

use tracing::debug;

use crate::llm::Tier;
use crate::progress::{ProgressTracker, SearchSignalTracker};

/// Auxiliary call sites that pick their own tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxNode {
    IntentInference,
    SearchAssessment,
    TaskValidation,
}

/// Stall tolerance before search assessment moves to the medium tier.
const MEDIUM_SEARCH_STALL: u32 = 2;

/// Artifact count that moves search assessment to the medium tier.
const MEDIUM_SEARCH_ARTIFACTS: usize = 3;

/// Context for an auxiliary tier decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuxContext<'a> {
    pub task: &'a str,
    pub iteration: u32,
    pub budget: u32,
    pub iterations_since_progress: u32,
    pub artifact_count: usize,
    pub evidence_density: f64,
    /// Task reads as informational (discovery/analysis).
    pub informational: bool,
}

/// Pick the tier for one auxiliary call. Defaults to small.
pub fn choose_smart_tier(node: AuxNode, ctx: &AuxContext<'_>) -> Tier {
    let task = ctx.task.to_lowercase();
    // Audit and reliability work warrants better judgment everywhere
    if ["audit", "reliab", "security", "incident"].iter().any(|m| task.contains(m)) {
        return Tier::Medium;
    }

    let tier = match node {
        AuxNode::IntentInference => Tier::Small,
        AuxNode::SearchAssessment => {
            if ctx.iterations_since_progress >= MEDIUM_SEARCH_STALL || ctx.artifact_count >= MEDIUM_SEARCH_ARTIFACTS {
                Tier::Medium
            } else {
                Tier::Small
            }
        }
        AuxNode::TaskValidation => {
            let late = ctx.iteration >= (6u32).max((0.7 * ctx.budget as f64) as u32);
            if (ctx.informational && ctx.evidence_density < 0.20) || late {
                Tier::Medium
            } else {
                Tier::Small
            }
        }
    };
    debug!(?node, ?tier, "choose_smart_tier");
    tier
}

/// The internal escalation signal. Bubbled one level as a tagged variant,
/// consumed only by the outer per-tier loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationSignal {
    pub reason: String,
    pub iteration: u32,
}

/// Inputs to the escalation decision.
#[derive(Debug, Clone, Copy)]
pub struct EscalationInputs<'a> {
    pub enabled: bool,
    /// Escalation is the main loop's move; runs with a parent callback
    /// report stuck instead.
    pub has_parent: bool,
    pub tier: Tier,
    pub iteration: u32,
    pub budget: u32,
    pub evidence_count: usize,
    pub tracker: &'a ProgressTracker,
    pub search: &'a SearchSignalTracker,
}

/// Decide whether the run should retry at the next tier up.
pub fn evaluate_escalation_need(inputs: &EscalationInputs<'_>) -> Option<EscalationSignal> {
    if !inputs.enabled || inputs.has_parent || inputs.tier == Tier::Large {
        return None;
    }

    let min_iteration = 3u32.max((0.25 * inputs.budget as f64).ceil() as u32);
    if inputs.iteration < min_iteration {
        return None;
    }

    if !inputs.tracker.is_stuck() {
        return None;
    }

    let recent_signal = inputs.search.signal_within(inputs.iteration, 3);
    let recent_progress = inputs.tracker.last_progress_iteration() > 0
        && inputs.iteration - inputs.tracker.last_progress_iteration() <= 2;
    if recent_signal || recent_progress {
        return None;
    }

    let utilization = inputs.iteration as f64 / inputs.budget as f64;
    let reason = if inputs.tracker.repeated_single_tool() {
        "repeating same tool calls without new signal"
    } else if utilization >= 0.45 && inputs.evidence_count <= 2 {
        "high iteration utilization with little evidence"
    } else {
        return None;
    };

    Some(EscalationSignal {
        reason: reason.to_string(),
        iteration: inputs.iteration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressInputs;

    fn stalled_tracker(iterations: u32) -> ProgressTracker {
        let mut tracker = ProgressTracker::new(3);
        for i in 1..=iterations {
            tracker.update(
                "grep_search",
                0,
                &ProgressInputs {
                    iteration: i,
                    evidence_delta: 0,
                    failed_tools_this_iteration: 0,
                    search_signal_hits: 0,
                },
            );
        }
        tracker
    }

    fn ctx<'a>(task: &'a str) -> AuxContext<'a> {
        AuxContext {
            task,
            iteration: 2,
            budget: 12,
            iterations_since_progress: 0,
            artifact_count: 0,
            evidence_density: 1.0,
            informational: false,
        }
    }

    #[test]
    fn test_default_tier_is_small() {
        assert_eq!(choose_smart_tier(AuxNode::IntentInference, &ctx("fix the bug")), Tier::Small);
        assert_eq!(choose_smart_tier(AuxNode::SearchAssessment, &ctx("fix the bug")), Tier::Small);
    }

    #[test]
    fn test_audit_tasks_bias_medium() {
        assert_eq!(
            choose_smart_tier(AuxNode::IntentInference, &ctx("audit the auth flow")),
            Tier::Medium
        );
    }

    #[test]
    fn test_search_assessment_biases() {
        let mut context = ctx("find Foo");
        context.iterations_since_progress = 2;
        assert_eq!(choose_smart_tier(AuxNode::SearchAssessment, &context), Tier::Medium);

        let mut context = ctx("find Foo");
        context.artifact_count = 3;
        assert_eq!(choose_smart_tier(AuxNode::SearchAssessment, &context), Tier::Medium);
    }

    #[test]
    fn test_validation_biases() {
        let mut context = ctx("explain the scheduler");
        context.informational = true;
        context.evidence_density = 0.1;
        assert_eq!(choose_smart_tier(AuxNode::TaskValidation, &context), Tier::Medium);

        let mut context = ctx("explain the scheduler");
        context.iteration = 9;
        context.budget = 12; // late: 9 >= max(6, 8)
        assert_eq!(choose_smart_tier(AuxNode::TaskValidation, &context), Tier::Medium);

        let context = ctx("explain the scheduler");
        assert_eq!(choose_smart_tier(AuxNode::TaskValidation, &context), Tier::Small);
    }

    #[test]
    fn test_escalation_on_repeated_single_tool() {
        let tracker = stalled_tracker(5);
        let search = SearchSignalTracker::new();
        let signal = evaluate_escalation_need(&EscalationInputs {
            enabled: true,
            has_parent: false,
            tier: Tier::Small,
            iteration: 5,
            budget: 12,
            evidence_count: 0,
            tracker: &tracker,
            search: &search,
        });

        let signal = signal.unwrap();
        assert_eq!(signal.reason, "repeating same tool calls without new signal");
        assert_eq!(signal.iteration, 5);
    }

    #[test]
    fn test_no_escalation_cases() {
        let tracker = stalled_tracker(5);
        let search = SearchSignalTracker::new();
        let base = EscalationInputs {
            enabled: true,
            has_parent: false,
            tier: Tier::Small,
            iteration: 5,
            budget: 12,
            evidence_count: 0,
            tracker: &tracker,
            search: &search,
        };

        // Disabled
        assert!(evaluate_escalation_need(&EscalationInputs { enabled: false, ..base }).is_none());
        // Child runs report to their parent instead
        assert!(evaluate_escalation_need(&EscalationInputs { has_parent: true, ..base }).is_none());
        // Already at the top
        assert!(evaluate_escalation_need(&EscalationInputs { tier: Tier::Large, ..base }).is_none());
        // Too early
        assert!(evaluate_escalation_need(&EscalationInputs { iteration: 2, ..base }).is_none());
    }

    #[test]
    fn test_no_escalation_when_not_stuck() {
        let mut tracker = ProgressTracker::new(3);
        tracker.update(
            "fs_read",
            500,
            &ProgressInputs {
                iteration: 5,
                evidence_delta: 1,
                failed_tools_this_iteration: 0,
                search_signal_hits: 0,
            },
        );
        let search = SearchSignalTracker::new();

        assert!(
            evaluate_escalation_need(&EscalationInputs {
                enabled: true,
                has_parent: false,
                tier: Tier::Small,
                iteration: 5,
                budget: 12,
                evidence_count: 1,
                tracker: &tracker,
                search: &search,
            })
            .is_none()
        );
    }
}
