//! KPI baselines
//!
//! Per-session exponential moving averages plus bounded sample histories.
//! The engine reads the baseline to derive token budgets and to detect
//! regressions; it writes one sample per completed run.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smoothing factor for all baseline EMAs.
pub const EMA_ALPHA: f64 = 0.25;

/// Maximum retained samples per history vector.
pub const HISTORY_LIMIT: usize = 50;

/// One run's worth of KPI observations.
#[derive(Debug, Clone, Copy)]
pub struct KpiSample {
    pub drift_rate: f64,
    pub evidence_density: f64,
    pub tool_error_rate: f64,
    pub tokens_used: u64,
    /// iterations used / iteration budget
    pub iteration_utilization: f64,
    pub quality_score: f64,
}

/// Persisted baseline for a session.
///
/// `token_history` and `quality_score_history` are parallel: entry `i` of
/// each comes from the same run. `observe` maintains that pairing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KpiBaseline {
    pub drift_rate_ema: f64,
    pub evidence_density_ema: f64,
    pub tool_error_rate_ema: f64,
    pub samples: u64,
    #[serde(default)]
    pub token_history: Vec<u64>,
    #[serde(default)]
    pub iteration_utilization_history: Vec<f64>,
    #[serde(default)]
    pub quality_score_history: Vec<f64>,
}

impl KpiBaseline {
    /// Fold one run's sample into the baseline. The first sample seeds the
    /// EMAs directly.
    pub fn observe(&mut self, sample: &KpiSample) {
        if self.samples == 0 {
            self.drift_rate_ema = sample.drift_rate;
            self.evidence_density_ema = sample.evidence_density;
            self.tool_error_rate_ema = sample.tool_error_rate;
        } else {
            self.drift_rate_ema = ema(self.drift_rate_ema, sample.drift_rate);
            self.evidence_density_ema = ema(self.evidence_density_ema, sample.evidence_density);
            self.tool_error_rate_ema = ema(self.tool_error_rate_ema, sample.tool_error_rate);
        }
        self.samples += 1;

        push_bounded(&mut self.token_history, sample.tokens_used);
        push_bounded(&mut self.iteration_utilization_history, sample.iteration_utilization);
        push_bounded(&mut self.quality_score_history, sample.quality_score);

        debug!(
            samples = self.samples,
            drift = self.drift_rate_ema,
            density = self.evidence_density_ema,
            error_rate = self.tool_error_rate_ema,
            "KpiBaseline::observe"
        );
    }

    /// Token usage of past runs whose quality score met `min_quality`.
    ///
    /// Relies on the pairing between `token_history` and
    /// `quality_score_history`; entries without a quality pair are skipped.
    pub fn quality_filtered_tokens(&self, min_quality: f64) -> Vec<u64> {
        self.token_history
            .iter()
            .zip(self.quality_score_history.iter())
            .filter(|(_, q)| **q >= min_quality)
            .map(|(t, _)| *t)
            .collect()
    }
}

fn ema(prev: f64, sample: f64) -> f64 {
    prev + EMA_ALPHA * (sample - prev)
}

fn push_bounded<T>(history: &mut Vec<T>, value: T) {
    history.push(value);
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(tokens: u64, quality: f64) -> KpiSample {
        KpiSample {
            drift_rate: 0.1,
            evidence_density: 0.5,
            tool_error_rate: 0.2,
            tokens_used: tokens,
            iteration_utilization: 0.7,
            quality_score: quality,
        }
    }

    #[test]
    fn test_first_sample_seeds_emas() {
        let mut baseline = KpiBaseline::default();
        baseline.observe(&sample(1000, 0.9));

        assert_eq!(baseline.samples, 1);
        assert_eq!(baseline.drift_rate_ema, 0.1);
        assert_eq!(baseline.evidence_density_ema, 0.5);
        assert_eq!(baseline.tool_error_rate_ema, 0.2);
    }

    #[test]
    fn test_ema_smoothing() {
        let mut baseline = KpiBaseline::default();
        baseline.observe(&sample(1000, 0.9));

        let mut second = sample(1000, 0.9);
        second.tool_error_rate = 1.0;
        baseline.observe(&second);

        // 0.2 + 0.25 * (1.0 - 0.2) = 0.4
        assert!((baseline.tool_error_rate_ema - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_histories_are_bounded() {
        let mut baseline = KpiBaseline::default();
        for i in 0..120 {
            baseline.observe(&sample(i, 0.8));
        }

        assert_eq!(baseline.token_history.len(), HISTORY_LIMIT);
        assert_eq!(baseline.quality_score_history.len(), HISTORY_LIMIT);
        // Oldest entries drained first
        assert_eq!(baseline.token_history[0], 70);
    }

    #[test]
    fn test_quality_filtered_tokens() {
        let mut baseline = KpiBaseline::default();
        baseline.observe(&sample(100, 0.9));
        baseline.observe(&sample(200, 0.5));
        baseline.observe(&sample(300, 0.8));

        assert_eq!(baseline.quality_filtered_tokens(0.75), vec![100, 300]);
    }
}
