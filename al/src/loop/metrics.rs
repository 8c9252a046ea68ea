//! Run KPIs and regression detection
//!
//! One `RunKpis` per run: derived rates feed the quality gate inputs, the
//! analytics sink, and the session baseline. Regressions compare this run
//! against the persisted EMAs.

use serde_json::{Value, json};
use sessionstore::{KpiBaseline, KpiSample};

use crate::domain::Intent;
use crate::llm::Tier;

/// Baselines younger than this many samples are not trusted for regression
/// verdicts.
const MIN_BASELINE_SAMPLES: u64 = 3;

/// Per-run key performance indicators.
#[derive(Debug, Clone)]
pub struct RunKpis {
    pub agent_id: String,
    pub intent: Intent,
    pub tier_started: Tier,
    pub tier_final: Tier,
    pub iterations_used: u32,
    pub iteration_budget: u32,
    pub tokens_used: u64,
    pub token_budget: u64,
    pub tool_calls: u32,
    pub tool_errors: u32,
    pub touched_domains: usize,
    pub files_read: usize,
    pub files_modified: usize,
    pub files_created: usize,
    pub search_signal_hits: u32,
    pub quality_score: f64,
    pub quality_passed: bool,
    pub escalations: Vec<(Tier, Tier)>,
    pub hypothesis_switches: u32,
    pub budget_extensions: u32,
}

impl RunKpis {
    pub fn iteration_utilization(&self) -> f64 {
        if self.iteration_budget == 0 {
            return 0.0;
        }
        self.iterations_used as f64 / self.iteration_budget as f64
    }

    pub fn evidence_density(&self) -> f64 {
        if self.iterations_used == 0 {
            return 0.0;
        }
        (self.files_read + self.files_modified + self.files_created) as f64 / self.iterations_used as f64
    }

    pub fn tool_error_rate(&self) -> f64 {
        if self.tool_calls == 0 {
            return 0.0;
        }
        self.tool_errors as f64 / self.tool_calls as f64
    }

    pub fn drift_rate(&self) -> f64 {
        if self.tool_calls == 0 {
            return 0.0;
        }
        self.touched_domains.saturating_sub(1) as f64 / self.tool_calls as f64
    }

    /// The sample folded into the session baseline.
    pub fn to_sample(&self) -> KpiSample {
        KpiSample {
            drift_rate: self.drift_rate(),
            evidence_density: self.evidence_density(),
            tool_error_rate: self.tool_error_rate(),
            tokens_used: self.tokens_used,
            iteration_utilization: self.iteration_utilization(),
            quality_score: self.quality_score,
        }
    }

    /// Analytics payload.
    pub fn payload(&self) -> Value {
        json!({
            "agent_id": self.agent_id,
            "intent": self.intent.as_str(),
            "tier_started": self.tier_started.as_str(),
            "tier_final": self.tier_final.as_str(),
            "iterations_used": self.iterations_used,
            "iteration_budget": self.iteration_budget,
            "iteration_utilization": self.iteration_utilization(),
            "tokens_used": self.tokens_used,
            "token_budget": self.token_budget,
            "tool_calls": self.tool_calls,
            "tool_error_rate": self.tool_error_rate(),
            "evidence_density": self.evidence_density(),
            "drift_rate": self.drift_rate(),
            "search_signal_hits": self.search_signal_hits,
            "quality_score": self.quality_score,
            "quality_passed": self.quality_passed,
            "escalations": self.escalations.len(),
            "hypothesis_switches": self.hypothesis_switches,
            "budget_extensions": self.budget_extensions,
        })
    }

    /// Compare against the persisted baseline; one line per regression.
    pub fn detect_regressions(&self, baseline: &KpiBaseline) -> Vec<String> {
        if baseline.samples < MIN_BASELINE_SAMPLES {
            return Vec::new();
        }
        let mut regressions = Vec::new();

        if self.tool_error_rate() > baseline.tool_error_rate_ema * 1.5 + 0.05 {
            regressions.push(format!(
                "tool error rate {:.2} vs baseline {:.2}",
                self.tool_error_rate(),
                baseline.tool_error_rate_ema
            ));
        }
        if self.drift_rate() > baseline.drift_rate_ema * 1.5 + 0.05 {
            regressions.push(format!(
                "drift rate {:.2} vs baseline {:.2}",
                self.drift_rate(),
                baseline.drift_rate_ema
            ));
        }
        if baseline.evidence_density_ema > 0.0 && self.evidence_density() < baseline.evidence_density_ema * 0.5 {
            regressions.push(format!(
                "evidence density {:.2} vs baseline {:.2}",
                self.evidence_density(),
                baseline.evidence_density_ema
            ));
        }
        regressions
    }
}
