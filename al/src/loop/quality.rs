//! Quality gate - scoring a finished run
//!
//! Starts from a perfect score and subtracts for error rate, scope drift,
//! thin evidence, missing planning discipline and ledger failures. Below
//! the pass threshold the result carries a needs-clarification suffix.

use tracing::debug;

/// Pass/partial boundary.
const PASS_THRESHOLD: f64 = 0.55;

/// Everything the gate scores, captured at termination.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualityInputs {
    pub iterations_used: u32,
    pub tool_calls_total: u32,
    pub tool_error_count: u32,
    pub touched_domains: usize,
    pub files_read: usize,
    pub files_modified: usize,
    pub files_created: usize,
    pub search_signal_hits: u32,
    pub task_multi_step: bool,
    pub todo_calls: u32,
    pub failed_ledger_steps: usize,
    pub pending_ledger_steps: usize,
}

impl QualityInputs {
    pub fn evidence_count(&self) -> usize {
        self.files_read + self.files_modified + self.files_created
    }

    /// Evidence items per iteration.
    pub fn evidence_density(&self) -> f64 {
        if self.iterations_used == 0 {
            return 0.0;
        }
        self.evidence_count() as f64 / self.iterations_used as f64
    }

    pub fn tool_error_rate(&self) -> f64 {
        if self.tool_calls_total == 0 {
            return 0.0;
        }
        self.tool_error_count as f64 / self.tool_calls_total as f64
    }

    /// Scope-creep proxy: extra domains per tool call.
    pub fn drift_rate(&self) -> f64 {
        if self.tool_calls_total == 0 {
            return 0.0;
        }
        self.touched_domains.saturating_sub(1) as f64 / self.tool_calls_total as f64
    }
}

/// Gate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityStatus {
    Pass,
    Partial,
}

/// Full gate output.
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub status: QualityStatus,
    pub score: f64,
    pub reasons: Vec<String>,
    pub next_checks: Vec<String>,
}

impl QualityReport {
    /// The user-visible suffix for partial results, with up to four
    /// suggested next checks.
    pub fn clarification_suffix(&self) -> Option<String> {
        if self.status == QualityStatus::Pass {
            return None;
        }
        let mut out = String::from("\n\n[Needs Clarification] ");
        out.push_str(&self.reasons.join("; "));
        if !self.next_checks.is_empty() {
            out.push_str("\nSuggested next checks:\n");
            for check in self.next_checks.iter().take(4) {
                out.push_str(&format!("- {check}\n"));
            }
        }
        Some(out)
    }
}

/// Evaluate the gate.
pub fn evaluate(inputs: &QualityInputs) -> QualityReport {
    let mut score = 1.0_f64;
    let mut reasons = Vec::new();
    let mut next_checks = Vec::new();

    if inputs.tool_error_rate() >= 0.30 {
        score -= 0.35;
        reasons.push(format!("high tool error rate ({:.0}%)", inputs.tool_error_rate() * 100.0));
        next_checks.push("rerun the failing tools with corrected arguments".to_string());
    }

    if inputs.touched_domains >= 2 && inputs.drift_rate() >= 0.20 {
        score -= 0.25;
        reasons.push(format!("scope drifted across {} domains", inputs.touched_domains));
        next_checks.push("confirm which directory actually owns the task".to_string());
    }

    let thin_evidence = inputs.evidence_density() < 0.20 && inputs.tool_calls_total >= 5;
    if thin_evidence {
        if inputs.search_signal_hits == 0 {
            score -= 0.20;
            reasons.push("little evidence gathered and no search signal".to_string());
            next_checks.push("search for the key symbol with a broader pattern".to_string());
        } else {
            score -= 0.08;
            reasons.push("evidence density is low".to_string());
        }
    }

    if inputs.task_multi_step && inputs.iterations_used >= 5 && inputs.todo_calls == 0 {
        score -= 0.15;
        reasons.push("multi-step task ran without a todo list".to_string());
        next_checks.push("break the remaining work into todo items".to_string());
    }

    if inputs.failed_ledger_steps > 0 {
        score -= 0.20;
        reasons.push(format!("{} tool step(s) failed", inputs.failed_ledger_steps));
        next_checks.push("retry the failed steps and verify their outputs".to_string());
    }

    if inputs.pending_ledger_steps > 0 {
        score -= 0.10;
        reasons.push(format!("{} tool step(s) never completed", inputs.pending_ledger_steps));
    }

    let score = score.max(0.0);
    let status = if score >= PASS_THRESHOLD {
        QualityStatus::Pass
    } else {
        QualityStatus::Partial
    };

    debug!(?status, score, reasons = reasons.len(), "quality gate evaluated");
    QualityReport {
        status,
        score,
        reasons,
        next_checks,
    }
}

/// The strong-evidence predicate used by cost-aware tool restriction.
pub fn has_strong_evidence_signal(inputs: &QualityInputs) -> bool {
    inputs.evidence_count() >= 3
        && inputs.evidence_density() >= 0.55
        && inputs.drift_rate() <= 0.08
        && inputs.tool_error_rate() <= 0.10
}

/// Rough check for tasks that read as multi-step.
pub fn looks_multi_step(task: &str) -> bool {
    let task_lower = task.to_lowercase();
    if [" and ", " then ", " after that", "; "].iter().any(|m| task_lower.contains(m)) {
        return true;
    }
    // Numbered or bulleted lists
    task.lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("- ") || t.starts_with("* ") || t.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
        })
        .count()
        >= 2
}
