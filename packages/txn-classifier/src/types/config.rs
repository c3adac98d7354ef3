//! Configuration for the classification pipeline.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::traits::budget::BudgetCap;
use crate::types::metrics::{MetricsSummary, MetricsWindow};
use crate::types::tier::Tier;
use crate::types::training::TrainingWindow;

/// Minimum evidence required to hold a graduation tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierFloor {
    /// Training examples in the rolling window
    pub min_examples: usize,
    /// Evaluated outcomes in the metrics window
    pub min_evaluated: usize,
    pub accuracy: f32,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
}

impl TierFloor {
    pub const fn new(
        min_examples: usize,
        min_evaluated: usize,
        accuracy: f32,
        precision: f32,
        recall: f32,
        f1: f32,
    ) -> Self {
        Self {
            min_examples,
            min_evaluated,
            accuracy,
            precision,
            recall,
            f1,
        }
    }

    /// Whether any metric floor is set.
    pub fn is_gated(&self) -> bool {
        self.accuracy > 0.0 || self.precision > 0.0 || self.recall > 0.0 || self.f1 > 0.0
    }

    /// Whether the evidence meets every floor.
    pub fn admits(&self, example_count: usize, metrics: &MetricsSummary) -> bool {
        example_count >= self.min_examples
            && metrics.evaluated >= self.min_evaluated
            && metrics.accuracy >= self.accuracy
            && metrics.precision >= self.precision
            && metrics.recall >= self.recall
            && metrics.f1 >= self.f1
    }

    fn metric_fields(&self) -> [(&'static str, f32); 4] {
        [
            ("accuracy", self.accuracy),
            ("precision", self.precision),
            ("recall", self.recall),
            ("f1", self.f1),
        ]
    }
}

/// Floors for tiers 2 through 5 (tier 1 has none).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierFloors {
    pub validating: TierFloor,
    pub assisting: TierFloor,
    pub primary: TierFloor,
    pub graduated: TierFloor,
}

impl Default for TierFloors {
    fn default() -> Self {
        Self {
            validating: TierFloor::new(50, 0, 0.0, 0.0, 0.0, 0.0),
            assisting: TierFloor::new(150, 30, 0.80, 0.75, 0.80, 0.77),
            primary: TierFloor::new(400, 50, 0.93, 0.88, 0.92, 0.90),
            graduated: TierFloor::new(1000, 100, 0.96, 0.93, 0.96, 0.94),
        }
    }
}

impl TierFloors {
    /// Floor for a tier (None for tier 1).
    pub fn floor(&self, tier: Tier) -> Option<&TierFloor> {
        match tier {
            Tier::Learning => None,
            Tier::Validating => Some(&self.validating),
            Tier::Assisting => Some(&self.assisting),
            Tier::Primary => Some(&self.primary),
            Tier::Graduated => Some(&self.graduated),
        }
    }

    /// Reject floors where recall does not exceed precision at a gated tier,
    /// or where any floor decreases from one tier to the next.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut previous: Option<(Tier, &TierFloor)> = None;
        for tier in Tier::ALL.iter().copied().skip(1) {
            let Some(floor) = self.floor(tier) else {
                continue;
            };

            for (field, value) in floor.metric_fields() {
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::OutOfRange { field, value });
                }
            }

            if floor.is_gated() && floor.recall <= floor.precision {
                return Err(ConfigError::RecallBelowPrecision {
                    tier: tier.number(),
                    recall: floor.recall,
                    precision: floor.precision,
                });
            }

            if let Some((prev_tier, prev)) = previous {
                let counts = [
                    ("min_examples", floor.min_examples < prev.min_examples),
                    ("min_evaluated", floor.min_evaluated < prev.min_evaluated),
                ];
                let metrics = floor
                    .metric_fields()
                    .into_iter()
                    .zip(prev.metric_fields())
                    .map(|((field, value), (_, prev_value))| (field, value < prev_value));

                if let Some((field, _)) = counts.into_iter().chain(metrics).find(|(_, lower)| *lower) {
                    return Err(ConfigError::NonMonotonicFloor {
                        tier: tier.number(),
                        previous: prev_tier.number(),
                        field,
                    });
                }
            }
            previous = Some((tier, floor));
        }
        Ok(())
    }
}

/// Hyperparameters for local model training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingParams {
    pub epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub l2: f32,
    pub seed: u64,
    /// Ignore terms appearing in fewer documents than this
    pub min_document_frequency: usize,
    /// Keep at most this many terms (by document frequency)
    pub max_features: usize,
    /// Reweight classes inversely to their frequency
    pub balance_classes: bool,
    /// Refuse to train on fewer examples
    pub min_examples: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            epochs: 40,
            learning_rate: 0.5,
            batch_size: 32,
            l2: 1e-5,
            seed: 42,
            min_document_frequency: 2,
            max_features: 20_000,
            balance_classes: true,
            min_examples: 10,
        }
    }
}

/// Configuration for the classification pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Representatives per LLM request. Default: 20.
    pub batch_size: usize,

    /// Local confidence needed to skip the LLM at tier 4 (tier 5 uses
    /// 0.9 of this). Default: 0.80.
    pub confidence_threshold: f32,

    /// Token cap per user per monthly period (None = unlimited).
    pub budget_cap_tokens: Option<u64>,

    /// Cost cap in USD per user per monthly period (None = unlimited).
    pub budget_cap_cost: Option<f64>,

    /// USD per 1k tokens, used to derive cost from token usage.
    pub cost_per_1k_tokens: f64,

    pub tier_floors: TierFloors,

    /// New examples since the last snapshot that trigger retraining.
    /// Default: 50.
    pub retrain_example_threshold: usize,

    /// Retrain in the background after classify/feedback. Default: true.
    pub auto_retrain: bool,

    pub llm_timeout_ms: u64,
    pub llm_max_retries: u32,
    pub llm_backoff_base_ms: u64,
    pub llm_requests_per_minute: u32,
    pub llm_max_concurrency: usize,

    /// Truncate subject + body to this many characters before analysis.
    pub max_chars_per_message: usize,

    /// LLM confidence at which LLM/pattern agreement seeds a training
    /// example. Default: 0.85.
    pub llm_seed_confidence: f32,

    /// Training weight of LLM-sourced examples relative to user ones.
    /// Default: 0.5.
    pub llm_example_weight: f32,

    pub training_window: TrainingWindow,
    pub metrics_window: MetricsWindow,
    pub training: TrainingParams,

    /// Deployment-specific junk labels on top of the built-in markers.
    #[serde(default)]
    pub extra_junk_labels: Vec<String>,

    /// Write attempts before a result is held as uncommitted.
    pub persist_max_attempts: u32,
    pub persist_backoff_ms: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            confidence_threshold: 0.80,
            budget_cap_tokens: None,
            budget_cap_cost: None,
            cost_per_1k_tokens: 0.0006,
            tier_floors: TierFloors::default(),
            retrain_example_threshold: 50,
            auto_retrain: true,
            llm_timeout_ms: 30_000,
            llm_max_retries: 2,
            llm_backoff_base_ms: 500,
            llm_requests_per_minute: 60,
            llm_max_concurrency: 4,
            max_chars_per_message: 4_000,
            llm_seed_confidence: 0.85,
            llm_example_weight: 0.5,
            training_window: TrainingWindow::default(),
            metrics_window: MetricsWindow::default(),
            training: TrainingParams::default(),
            extra_junk_labels: vec![],
            persist_max_attempts: 3,
            persist_backoff_ms: 50,
        }
    }
}

impl ClassifierConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_budget_cap_tokens(mut self, tokens: u64) -> Self {
        self.budget_cap_tokens = Some(tokens);
        self
    }

    pub fn with_budget_cap_cost(mut self, usd: f64) -> Self {
        self.budget_cap_cost = Some(usd);
        self
    }

    pub fn with_tier_floors(mut self, floors: TierFloors) -> Self {
        self.tier_floors = floors;
        self
    }

    pub fn with_retrain_threshold(mut self, examples: usize) -> Self {
        self.retrain_example_threshold = examples;
        self
    }

    pub fn with_auto_retrain(mut self, enabled: bool) -> Self {
        self.auto_retrain = enabled;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_llm_retries(mut self, retries: u32, backoff_base: Duration) -> Self {
        self.llm_max_retries = retries;
        self.llm_backoff_base_ms = backoff_base.as_millis() as u64;
        self
    }

    pub fn with_llm_rate(mut self, requests_per_minute: u32, max_concurrency: usize) -> Self {
        self.llm_requests_per_minute = requests_per_minute;
        self.llm_max_concurrency = max_concurrency;
        self
    }

    pub fn with_extra_junk_labels(
        mut self,
        labels: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.extra_junk_labels = labels.into_iter().map(|l| l.into()).collect();
        self
    }

    pub fn with_training(mut self, training: TrainingParams) -> Self {
        self.training = training;
        self
    }

    pub fn with_persist_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.persist_max_attempts = attempts;
        self.persist_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn llm_backoff_base(&self) -> Duration {
        Duration::from_millis(self.llm_backoff_base_ms)
    }

    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }

    pub fn budget_cap(&self) -> BudgetCap {
        BudgetCap {
            max_tokens: self.budget_cap_tokens,
            max_cost_usd: self.budget_cap_cost,
            cost_per_1k_tokens: self.cost_per_1k_tokens,
        }
    }

    /// Check every option, including the tier floor table.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("batch_size", self.batch_size),
            ("retrain_example_threshold", self.retrain_example_threshold),
            ("llm_max_concurrency", self.llm_max_concurrency),
            ("llm_requests_per_minute", self.llm_requests_per_minute as usize),
            ("max_chars_per_message", self.max_chars_per_message),
            ("persist_max_attempts", self.persist_max_attempts as usize),
            ("training.batch_size", self.training.batch_size),
            ("training.epochs", self.training.epochs),
            ("training_window.max_examples", self.training_window.max_examples),
            ("metrics_window.max_outcomes", self.metrics_window.max_outcomes),
        ];
        if let Some((field, _)) = positive.into_iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::NonPositive { field });
        }
        if self.llm_timeout_ms == 0 {
            return Err(ConfigError::NonPositive {
                field: "llm_timeout_ms",
            });
        }

        let unit = [
            ("confidence_threshold", self.confidence_threshold),
            ("llm_seed_confidence", self.llm_seed_confidence),
            ("llm_example_weight", self.llm_example_weight),
        ];
        for (field, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { field, value });
            }
        }
        if self.confidence_threshold == 0.0 {
            return Err(ConfigError::NonPositive {
                field: "confidence_threshold",
            });
        }

        self.tier_floors.validate()
    }
}
