//! Rolling-window model metrics.
//!
//! The window holds one outcome per classification result; recording a
//! second outcome for the same result (e.g. user feedback after a
//! provisional LLM-derived outcome) replaces the first in place.

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::training::{LabelSource, TaskType};

/// A local-model prediction compared against ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub result_id: Uuid,
    pub predicted: String,
    pub actual: String,
    /// Local snapshot version that made the prediction
    pub model_version: Option<i64>,
    pub source: LabelSource,
    pub recorded_at: DateTime<Utc>,
}

/// Bounds of the rolling window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsWindow {
    pub max_outcomes: usize,
    pub max_age_days: i64,
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self {
            max_outcomes: 500,
            max_age_days: 90,
        }
    }
}

/// Confusion-matrix counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
    /// Outcomes evaluated (differs from the sum for multi-class tasks)
    pub evaluated: usize,
    pub correct: usize,
}

impl ConfusionCounts {
    pub fn summary(&self) -> MetricsSummary {
        let ratio = |num: usize, den: usize| {
            if den == 0 {
                0.0
            } else {
                num as f32 / den as f32
            }
        };
        let precision = ratio(self.true_positive, self.true_positive + self.false_positive);
        let recall = ratio(self.true_positive, self.true_positive + self.false_negative);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };
        MetricsSummary {
            accuracy: ratio(self.correct, self.evaluated),
            precision,
            recall,
            f1,
            evaluated: self.evaluated,
        }
    }
}

/// Derived metrics read by the graduation policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    pub evaluated: usize,
}

/// Rolling-window outcomes for one user and task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub task: TaskType,
    pub window: MetricsWindow,
    outcomes: IndexMap<Uuid, Outcome>,
}

impl ModelMetrics {
    pub fn new(task: TaskType, window: MetricsWindow) -> Self {
        Self {
            task,
            window,
            outcomes: IndexMap::new(),
        }
    }

    /// Record (or replace) the outcome for a result, then trim the window.
    pub fn record(&mut self, outcome: Outcome) {
        let now = outcome.recorded_at;
        match self.outcomes.get_mut(&outcome.result_id) {
            Some(existing) => *existing = outcome,
            None => {
                self.outcomes.insert(outcome.result_id, outcome);
            }
        }
        self.trim(now);
    }

    /// Drop outcomes beyond the count bound or older than the age bound.
    pub fn trim(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(self.window.max_age_days);
        self.outcomes.retain(|_, o| o.recorded_at >= cutoff);
        while self.outcomes.len() > self.window.max_outcomes {
            self.outcomes.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.values()
    }

    pub fn counts(&self) -> ConfusionCounts {
        Self::count(self.task, self.outcomes.values())
    }

    /// Counts restricted to predictions made by one snapshot version.
    pub fn counts_for_version(&self, version: i64) -> ConfusionCounts {
        Self::count(
            self.task,
            self.outcomes
                .values()
                .filter(|o| o.model_version == Some(version)),
        )
    }

    pub fn summary(&self) -> MetricsSummary {
        self.counts().summary()
    }

    fn count<'a>(task: TaskType, outcomes: impl Iterator<Item = &'a Outcome>) -> ConfusionCounts {
        let mut counts = ConfusionCounts::default();
        for outcome in outcomes {
            counts.evaluated += 1;
            let correct = outcome.predicted == outcome.actual;
            if correct {
                counts.correct += 1;
            }
            match task.positive_class() {
                Some(positive) => {
                    let predicted = outcome.predicted == positive;
                    let actual = outcome.actual == positive;
                    match (predicted, actual) {
                        (true, true) => counts.true_positive += 1,
                        (true, false) => counts.false_positive += 1,
                        (false, false) => counts.true_negative += 1,
                        (false, true) => counts.false_negative += 1,
                    }
                }
                None => {
                    // Micro-average: a miss is one FP and one FN.
                    if correct {
                        counts.true_positive += 1;
                    } else {
                        counts.false_positive += 1;
                        counts.false_negative += 1;
                    }
                }
            }
        }
        counts
    }
}
