//! FactSheet - hot working memory
//!
//! A small, deduplicated sheet of facts injected into every system prompt.
//! Near-duplicates within a category merge (max confidence wins); overflow
//! evicts lowest-confidence-then-oldest entries until the estimated token
//! cap holds again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::FactSheetConfig;

/// Hard cap on a single fact's length.
const MAX_FACT_CHARS: usize = 280;

/// One remembered fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactEntry {
    pub id: u64,
    pub category: String,
    pub fact: String,
    pub confidence: f64,
    pub source: String,
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
}

/// A fact candidate, before dedup/caps.
#[derive(Debug, Clone)]
pub struct NewFact {
    pub category: String,
    pub fact: String,
    pub confidence: f64,
    pub source: String,
    pub iteration: u32,
}

/// What happened to an added fact.
#[derive(Debug, Clone, Copy)]
pub struct AddOutcome {
    pub id: u64,
    pub merged: bool,
}

/// The hot memory tier.
#[derive(Debug)]
pub struct FactSheet {
    entries: Vec<FactEntry>,
    config: FactSheetConfig,
    next_id: u64,
}

impl FactSheet {
    pub fn new(config: &FactSheetConfig) -> Self {
        Self {
            entries: Vec::new(),
            config: config.clone(),
            next_id: 1,
        }
    }

    /// Add a fact, merging near-duplicates within the category.
    pub fn add_fact(&mut self, fact: NewFact) -> AddOutcome {
        let text = clip(&fact.fact, MAX_FACT_CHARS);
        let normalized = normalize(&text);

        if let Some(existing) = self.entries.iter_mut().find(|e| {
            e.category == fact.category && dice_similarity(&normalize(&e.fact), &normalized) >= self.config.merge_similarity
        }) {
            existing.confidence = existing.confidence.max(fact.confidence);
            existing.iteration = existing.iteration.max(fact.iteration);
            let outcome = AddOutcome {
                id: existing.id,
                merged: true,
            };
            debug!(id = outcome.id, category = %fact.category, "FactSheet::add_fact: merged");
            return outcome;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(FactEntry {
            id,
            category: fact.category.clone(),
            fact: text,
            confidence: fact.confidence,
            source: fact.source,
            iteration: fact.iteration,
            created_at: Utc::now(),
        });

        self.enforce_category_cap(&fact.category);
        self.enforce_token_cap();

        AddOutcome { id, merged: false }
    }

    fn enforce_category_cap(&mut self, category: &str) {
        loop {
            let count = self.entries.iter().filter(|e| e.category == category).count();
            if count <= self.config.max_entries_per_category {
                return;
            }
            let victim = self
                .entries
                .iter()
                .filter(|e| e.category == category)
                .min_by(|a, b| eviction_order(a, b))
                .map(|e| e.id);
            match victim {
                Some(id) => self.remove(id),
                None => return,
            }
        }
    }

    fn enforce_token_cap(&mut self) {
        while self.est_tokens() > self.config.max_tokens && !self.entries.is_empty() {
            let victim = self.entries.iter().min_by(|a, b| eviction_order(a, b)).map(|e| e.id);
            match victim {
                Some(id) => self.remove(id),
                None => return,
            }
        }
    }

    fn remove(&mut self, id: u64) {
        debug!(id, "FactSheet::remove: evicting");
        self.entries.retain(|e| e.id != id);
    }

    /// Estimated token footprint of the rendered sheet.
    pub fn est_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.fact.len() / 4 + e.category.len() / 4 + 2).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FactEntry] {
        &self.entries
    }

    /// Render as a markdown section for the system prompt.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }

        let mut categories: Vec<&str> = self.entries.iter().map(|e| e.category.as_str()).collect();
        categories.sort_unstable();
        categories.dedup();

        let mut out = String::from("## Known facts\n");
        for category in categories {
            out.push_str(&format!("### {category}\n"));
            for entry in self.entries.iter().filter(|e| e.category == category) {
                out.push_str(&format!("- {} (confidence {:.2})\n", entry.fact, entry.confidence));
            }
        }
        out
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Word-set Dice coefficient over normalized text.
fn dice_similarity(a: &str, b: &str) -> f64 {
    let words_a: std::collections::HashSet<&str> = a.split(' ').filter(|w| !w.is_empty()).collect();
    let words_b: std::collections::HashSet<&str> = b.split(' ').filter(|w| !w.is_empty()).collect();
    if words_a.is_empty() && words_b.is_empty() {
        return 1.0;
    }
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let common = words_a.intersection(&words_b).count();
    (2.0 * common as f64) / (words_a.len() + words_b.len()) as f64
}

fn eviction_order(a: &FactEntry, b: &FactEntry) -> std::cmp::Ordering {
    a.confidence
        .partial_cmp(&b.confidence)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(category: &str, text: &str, confidence: f64, iteration: u32) -> NewFact {
        NewFact {
            category: category.to_string(),
            fact: text.to_string(),
            confidence,
            source: "test".to_string(),
            iteration,
        }
    }

    fn sheet() -> FactSheet {
        FactSheet::new(&FactSheetConfig::default())
    }

    #[test]
    fn test_add_distinct_facts() {
        let mut sheet = sheet();
        let a = sheet.add_fact(fact("files", "src/lib.rs exists with 120 lines", 0.9, 1));
        let b = sheet.add_fact(fact("files", "the parser module handles escape sequences", 0.8, 2));

        assert!(!a.merged);
        assert!(!b.merged);
        assert_eq!(sheet.len(), 2);
    }

    #[test]
    fn test_near_duplicate_merges_keeping_max_confidence() {
        let mut sheet = sheet();
        sheet.add_fact(fact("files", "file src/lib.rs exists; 120 lines read", 0.6, 1));
        let outcome = sheet.add_fact(fact("files", "File src/lib.rs  exists; 120 lines read", 0.9, 3));

        assert!(outcome.merged);
        assert_eq!(sheet.len(), 1);
        let entry = &sheet.entries()[0];
        assert_eq!(entry.confidence, 0.9);
        assert_eq!(entry.iteration, 3);
    }

    #[test]
    fn test_same_text_different_category_not_merged() {
        let mut sheet = sheet();
        sheet.add_fact(fact("files", "config lives in app.yaml", 0.7, 1));
        let outcome = sheet.add_fact(fact("searches", "config lives in app.yaml", 0.7, 1));

        assert!(!outcome.merged);
        assert_eq!(sheet.len(), 2);
    }

    #[test]
    fn test_category_cap_evicts_lowest_confidence() {
        let config = FactSheetConfig {
            max_entries_per_category: 2,
            ..Default::default()
        };
        let mut sheet = FactSheet::new(&config);
        sheet.add_fact(fact("files", "alpha module parses headers", 0.9, 1));
        sheet.add_fact(fact("files", "beta module renders output", 0.3, 1));
        sheet.add_fact(fact("files", "gamma module validates input", 0.8, 2));

        assert_eq!(sheet.len(), 2);
        assert!(!sheet.entries().iter().any(|e| e.fact.contains("beta")));
    }

    #[test]
    fn test_token_cap_holds_after_every_add() {
        let config = FactSheetConfig {
            max_tokens: 60,
            ..Default::default()
        };
        let mut sheet = FactSheet::new(&config);
        for i in 0..30 {
            // Distinct enough that nothing merges
            sheet.add_fact(fact(
                "files",
                &format!("observation-{i} concerns subsystem-{i} via entry-{i}"),
                0.5 + (i as f64) * 0.01,
                i,
            ));
            assert!(sheet.est_tokens() <= 60);
        }
        assert!(!sheet.is_empty());
        assert!(sheet.len() > 1);
    }

    #[test]
    fn test_fact_clipped_to_max_chars() {
        let mut sheet = sheet();
        let long = "x".repeat(500);
        sheet.add_fact(fact("files", &long, 0.9, 1));
        assert_eq!(sheet.entries()[0].fact.chars().count(), MAX_FACT_CHARS);
    }

    #[test]
    fn test_render_groups_by_category() {
        let mut sheet = sheet();
        sheet.add_fact(fact("files", "lib.rs read", 0.9, 1));
        sheet.add_fact(fact("searches", "no match for Foo", 0.6, 2));

        let rendered = sheet.render();
        assert!(rendered.contains("### files"));
        assert!(rendered.contains("### searches"));
        assert!(rendered.contains("no match for Foo"));
    }

    #[test]
    fn test_dice_similarity() {
        assert_eq!(dice_similarity("a b c", "a b c"), 1.0);
        assert!(dice_similarity("file src exists lines", "file src exists read") > 0.7);
        assert!(dice_similarity("alpha beta", "gamma delta") < 0.1);
    }
}
