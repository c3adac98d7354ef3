//! Graduation tiers as a pure function of evidence.
//!
//! A tier is held only while its floors and the floors of every lower tier
//! are met, so demotion happens automatically as soon as live metrics drop.

use serde::{Deserialize, Serialize};

use crate::types::config::TierFloors;
use crate::types::metrics::MetricsSummary;
use crate::types::tier::{Tier, TierBehavior};
use crate::types::training::TaskType;

/// Maps (example count, metrics, model presence) to a tier.
#[derive(Debug, Clone, Default)]
pub struct GraduationPolicy {
    floors: TierFloors,
}

impl GraduationPolicy {
    pub fn new(floors: TierFloors) -> Self {
        Self { floors }
    }

    pub fn floors(&self) -> &TierFloors {
        &self.floors
    }

    /// Effective tier. Without a loadable local model the tier is 1.
    pub fn tier(&self, example_count: usize, metrics: &MetricsSummary, has_model: bool) -> Tier {
        if !has_model {
            return Tier::Learning;
        }
        let mut tier = Tier::Learning;
        for candidate in Tier::ALL.iter().copied().skip(1) {
            match self.floors.floor(candidate) {
                Some(floor) if floor.admits(example_count, metrics) => tier = candidate,
                _ => break,
            }
        }
        tier
    }

    /// Additional examples required by the next tier's example floor, or
    /// None at the top tier. Metric floors may still block promotion.
    pub fn examples_needed_for_next_tier(&self, tier: Tier, example_count: usize) -> Option<usize> {
        let next = tier.next()?;
        let floor = self.floors.floor(next)?;
        Some(floor.min_examples.saturating_sub(example_count))
    }
}

/// Read-only view of one user's progress on one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraduationStatus {
    pub user_id: String,
    pub task: TaskType,
    pub tier: Tier,
    pub behavior: TierBehavior,
    pub metrics: MetricsSummary,
    pub example_count: usize,
    pub examples_needed_for_next_tier: Option<usize>,
    /// Current committed snapshot version
    pub model_version: Option<i64>,
}
