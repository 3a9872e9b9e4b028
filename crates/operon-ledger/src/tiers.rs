//! Model-tier classification.
//!
//! Model ids are mapped to cost tiers by substring so new point
//! releases classify without code changes. Anything unrecognized is
//! treated as balanced rather than rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Economical,
    Balanced,
    MostCapable,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelTier::Economical => "economical",
            ModelTier::Balanced => "balanced",
            ModelTier::MostCapable => "most_capable",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "economical" => Ok(ModelTier::Economical),
            "balanced" => Ok(ModelTier::Balanced),
            "most_capable" => Ok(ModelTier::MostCapable),
            _ => Err(format!("Unknown model tier: {}", s)),
        }
    }
}

/// Substring rules checked in order; first match wins.
const TIER_RULES: &[(&str, ModelTier)] = &[
    ("haiku", ModelTier::Economical),
    ("sonnet", ModelTier::Balanced),
    ("opus", ModelTier::MostCapable),
];

/// Classifies a model id into its cost tier.
pub fn tier_for_model(model: &str) -> ModelTier {
    let lowered = model.to_lowercase();
    for (needle, tier) in TIER_RULES {
        if lowered.contains(needle) {
            return *tier;
        }
    }
    debug!(model, "No tier rule matched model id; assuming balanced");
    ModelTier::Balanced
}
