//! Model tiers
//!
//! Tiers order model size classes. Auxiliary calls pick a tier per call;
//! the main loop runs at one tier and escalates on stall.

use serde::{Deserialize, Serialize};

/// LLM size class. Ordering matters: escalation moves strictly upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    /// The next tier up, or None at the top.
    pub fn next_up(self) -> Option<Tier> {
        match self {
            Tier::Small => Some(Tier::Medium),
            Tier::Medium => Some(Tier::Large),
            Tier::Large => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tier-to-model mapping, part of the engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierModels {
    #[serde(default = "default_small_model")]
    pub small: String,
    #[serde(default = "default_medium_model")]
    pub medium: String,
    #[serde(default = "default_large_model")]
    pub large: String,
}

fn default_small_model() -> String {
    "claude-haiku-4-5".to_string()
}

fn default_medium_model() -> String {
    "claude-sonnet-4-5".to_string()
}

fn default_large_model() -> String {
    "claude-opus-4-5".to_string()
}

impl Default for TierModels {
    fn default() -> Self {
        Self {
            small: default_small_model(),
            medium: default_medium_model(),
            large: default_large_model(),
        }
    }
}

impl TierModels {
    /// Resolve a tier to its concrete model id.
    pub fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Small < Tier::Medium);
        assert!(Tier::Medium < Tier::Large);
    }

    #[test]
    fn test_tier_next_up() {
        assert_eq!(Tier::Small.next_up(), Some(Tier::Medium));
        assert_eq!(Tier::Medium.next_up(), Some(Tier::Large));
        assert_eq!(Tier::Large.next_up(), None);
    }

    #[test]
    fn test_model_resolution() {
        let models = TierModels::default();
        assert_eq!(models.model_for(Tier::Small), models.small);
        assert_eq!(models.model_for(Tier::Large), models.large);
    }

    #[test]
    fn test_tier_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Tier::Medium).unwrap(), "\"medium\"");
        let tier: Tier = serde_json::from_str("\"large\"").unwrap();
        assert_eq!(tier, Tier::Large);
    }
}
