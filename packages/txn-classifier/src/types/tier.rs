//! Graduation tiers and the engine behavior each tier mandates.

use serde::{Deserialize, Serialize};

/// Maturity level of a user's local model for one task.
///
/// Never stored: always recomputed from example count and live metrics by
/// [`crate::pipeline::graduation::GraduationPolicy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Learning = 1,
    Validating = 2,
    Assisting = 3,
    Primary = 4,
    Graduated = 5,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Learning,
        Tier::Validating,
        Tier::Assisting,
        Tier::Primary,
        Tier::Graduated,
    ];

    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn from_number(n: u8) -> Option<Self> {
        Tier::ALL.iter().copied().find(|t| t.number() == n)
    }

    pub fn next(&self) -> Option<Tier> {
        Tier::from_number(self.number() + 1)
    }

    pub fn behavior(&self) -> TierBehavior {
        match self {
            Tier::Learning => TierBehavior::LlmOnly,
            Tier::Validating => TierBehavior::Compare,
            Tier::Assisting => TierBehavior::Hybrid,
            Tier::Primary => TierBehavior::LocalPrimary,
            Tier::Graduated => TierBehavior::LocalOnly,
        }
    }

    /// Whether the local model is evaluated at this tier.
    pub fn invokes_local(&self) -> bool {
        *self >= Tier::Validating
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Tier::Learning => "learning",
            Tier::Validating => "validating",
            Tier::Assisting => "assisting",
            Tier::Primary => "primary",
            Tier::Graduated => "graduated",
        };
        write!(f, "{} ({})", self.number(), name)
    }
}

/// Engine routing strategy for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierBehavior {
    /// LLM + pattern; local never invoked
    LlmOnly,
    /// LLM + pattern decide; local computed silently for metrics
    Compare,
    /// LLM decides; local surfaced only when it agrees with the LLM
    Hybrid,
    /// Local decides when confident, otherwise LLM
    LocalPrimary,
    /// Local decides unless confidence < 0.9 x threshold
    LocalOnly,
}

impl TierBehavior {
    /// Minimum local confidence for local to be authoritative without an
    /// LLM call, or None when local is never authoritative.
    pub fn local_cutoff(&self, confidence_threshold: f32) -> Option<f32> {
        match self {
            TierBehavior::LocalPrimary => Some(confidence_threshold),
            TierBehavior::LocalOnly => Some(0.9 * confidence_threshold),
            _ => None,
        }
    }
}
