//! Turns user actions and confident LLM verdicts into training examples and
//! rolling-window outcomes.
//!
//! User feedback yields exactly one user-sourced example per affected task
//! and replaces any outcome already recorded for the same result. Confident
//! LLM verdicts that the pattern engine agrees with seed LLM-sourced
//! examples; at tiers 2 and 3 they also record a provisional outcome for the
//! silent local prediction.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ClassifierError, Result};
use crate::pipeline::locks::KeyedLocks;
use crate::traits::store::{MetricsStore, TrainingStore};
use crate::types::metrics::{MetricsWindow, ModelMetrics, Outcome};
use crate::types::result::ClassificationResult;
use crate::types::tier::Tier;
use crate::types::training::{
    detection_label, LabelSource, ModelKey, TaskType, TrainingExample, TransactionType,
};

/// Explicit user action on a classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FeedbackAction {
    /// The decision was right
    Accept,
    /// Not a transaction
    Dismiss,
    /// Replace the decision
    Correct {
        is_transaction: bool,
        transaction_type: Option<TransactionType>,
    },
}

impl FeedbackAction {
    /// Ground truth implied by the action for a result.
    fn truth(&self, result: &ClassificationResult) -> (bool, Option<TransactionType>) {
        match *self {
            FeedbackAction::Accept => (result.is_transaction, result.transaction_type),
            FeedbackAction::Dismiss => (false, None),
            FeedbackAction::Correct {
                is_transaction,
                transaction_type,
            } => (is_transaction, transaction_type.filter(|_| is_transaction)),
        }
    }
}

/// What a feedback call changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackReceipt {
    pub examples_added: usize,
    pub outcomes_recorded: usize,
    /// Tasks whose current model was rolled back, with the restored version
    #[serde(default)]
    pub rolled_back: Vec<(TaskType, i64)>,
}

#[derive(Clone)]
pub struct FeedbackRecorder {
    seed_confidence: f32,
    metrics_window: MetricsWindow,
    /// Serializes load-modify-save of each model's metrics window
    metrics_locks: Arc<KeyedLocks<ModelKey>>,
}

impl FeedbackRecorder {
    pub fn new(seed_confidence: f32, metrics_window: MetricsWindow) -> Self {
        Self {
            seed_confidence,
            metrics_window,
            metrics_locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Apply a user action to a persisted result.
    pub async fn record<S>(
        &self,
        store: &S,
        result: &ClassificationResult,
        action: FeedbackAction,
    ) -> Result<FeedbackReceipt>
    where
        S: TrainingStore + MetricsStore + ?Sized,
    {
        let features_ref = result
            .features_ref
            .clone()
            .ok_or_else(|| ClassifierError::FeaturesNotFound {
                features_ref: format!("result:{}", result.id),
            })?;
        let text = store
            .get_features(&result.user_id, &features_ref)
            .await?
            .ok_or_else(|| ClassifierError::FeaturesNotFound {
                features_ref: features_ref.clone(),
            })?;

        let (is_transaction, transaction_type) = action.truth(result);
        let mut receipt = FeedbackReceipt::default();

        let detection = ModelKey::detection(&result.user_id);
        store
            .append_example(
                &TrainingExample::new(
                    detection.clone(),
                    text.clone(),
                    detection_label(is_transaction),
                    LabelSource::User,
                )
                .for_result(result.id),
            )
            .await?;
        receipt.examples_added += 1;

        if let Some(predicted) = result.diagnostics.local_is_transaction {
            self.record_outcome(
                store,
                &detection,
                Outcome {
                    result_id: result.id,
                    predicted: detection_label(predicted).to_string(),
                    actual: detection_label(is_transaction).to_string(),
                    model_version: result.diagnostics.local_versions.0,
                    source: LabelSource::User,
                    recorded_at: Utc::now(),
                },
            )
            .await?;
            receipt.outcomes_recorded += 1;
        }

        if let Some(kind) = transaction_type {
            let type_key = ModelKey::transaction_type(&result.user_id);
            store
                .append_example(
                    &TrainingExample::new(type_key.clone(), text, kind.as_str(), LabelSource::User)
                        .for_result(result.id),
                )
                .await?;
            receipt.examples_added += 1;

            if let Some(predicted) = result.diagnostics.local_transaction_type {
                self.record_outcome(
                    store,
                    &type_key,
                    Outcome {
                        result_id: result.id,
                        predicted: predicted.as_str().to_string(),
                        actual: kind.as_str().to_string(),
                        model_version: result.diagnostics.local_versions.1,
                        source: LabelSource::User,
                        recorded_at: Utc::now(),
                    },
                )
                .await?;
                receipt.outcomes_recorded += 1;
            }
        }

        info!(
            user_id = %result.user_id,
            result_id = %result.id,
            ?action,
            examples = receipt.examples_added,
            outcomes = receipt.outcomes_recorded,
            "Recorded user feedback"
        );
        Ok(receipt)
    }

    /// Seed training data from a direct result's LLM verdict.
    ///
    /// Returns the number of examples appended.
    pub async fn seed_from_llm<S>(
        &self,
        store: &S,
        result: &ClassificationResult,
        text: &str,
    ) -> Result<usize>
    where
        S: TrainingStore + MetricsStore + ?Sized,
    {
        let diagnostics = &result.diagnostics;
        let (Some(llm_label), Some(llm_confidence)) =
            (diagnostics.llm_is_transaction, diagnostics.llm_confidence)
        else {
            return Ok(0);
        };
        if llm_confidence < self.seed_confidence {
            return Ok(0);
        }

        let detection = ModelKey::detection(&result.user_id);
        let mut added = 0;

        if diagnostics.pattern_is_transaction == llm_label {
            store
                .append_example(
                    &TrainingExample::new(
                        detection.clone(),
                        text,
                        detection_label(llm_label),
                        LabelSource::Llm,
                    )
                    .for_result(result.id),
                )
                .await?;
            added += 1;

            if let (true, Some(kind)) = (llm_label, diagnostics.llm_transaction_type) {
                store
                    .append_example(
                        &TrainingExample::new(
                            ModelKey::transaction_type(&result.user_id),
                            text,
                            kind.as_str(),
                            LabelSource::Llm,
                        )
                        .for_result(result.id),
                    )
                    .await?;
                added += 1;
            }
        }

        // Provisional outcome for the silent or agreeing local prediction.
        if matches!(result.tier, Tier::Validating | Tier::Assisting) {
            if let Some(predicted) = diagnostics.local_is_transaction {
                self.record_outcome(
                    store,
                    &detection,
                    Outcome {
                        result_id: result.id,
                        predicted: detection_label(predicted).to_string(),
                        actual: detection_label(llm_label).to_string(),
                        model_version: diagnostics.local_versions.0,
                        source: LabelSource::Llm,
                        recorded_at: Utc::now(),
                    },
                )
                .await?;
            }
        }

        if added > 0 {
            debug!(user_id = %result.user_id, result_id = %result.id, added, "Seeded examples from LLM");
        }
        Ok(added)
    }

    /// Start a fresh metrics window for a key.
    pub async fn reset_metrics<S: MetricsStore + ?Sized>(&self, store: &S, key: &ModelKey) -> Result<()> {
        let _guard = self.metrics_locks.lock(key).await;
        store
            .save_metrics(key, &ModelMetrics::new(key.task, self.metrics_window))
            .await
    }

    /// Current metrics for a key (an empty window when none are stored).
    pub async fn metrics<S: MetricsStore + ?Sized>(&self, store: &S, key: &ModelKey) -> Result<ModelMetrics> {
        Ok(store
            .load_metrics(key)
            .await?
            .unwrap_or_else(|| ModelMetrics::new(key.task, self.metrics_window)))
    }

    async fn record_outcome<S: MetricsStore + ?Sized>(
        &self,
        store: &S,
        key: &ModelKey,
        outcome: Outcome,
    ) -> Result<()> {
        let _guard = self.metrics_locks.lock(key).await;
        let mut metrics = self.metrics(store, key).await?;
        metrics.record(outcome);
        store.save_metrics(key, &metrics).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::FlakyStore;
    use crate::traits::store::ResultStore;
    use crate::types::message::ThreadKey;
    use crate::types::result::Engine;
    use crate::types::training::{features_ref, TrainingWindow, TRANSACTION_CLASS};

    async fn stored_result<S>(store: &S, text: &str) -> ClassificationResult
    where
        S: ResultStore + TrainingStore,
    {
        let reference = features_ref(text);
        store.put_features("u1", &reference, text).await.unwrap();
        let mut result = ClassificationResult::filtered("u1", "m1", ThreadKey::Singleton("m1".into()));
        result.engine_used = Engine::Llm;
        result.is_transaction = true;
        result.transaction_type = Some(TransactionType::Purchase);
        result.tier = Tier::Assisting;
        result.features_ref = Some(reference);
        result.diagnostics.local_is_transaction = Some(true);
        result.diagnostics.local_versions = (Some(3), None);
        store.save_result(&result).await.unwrap();
        result
    }

    fn recorder() -> FeedbackRecorder {
        FeedbackRecorder::new(0.85, MetricsWindow::default())
    }

    #[tokio::test]
    async fn test_accept_yields_one_example_per_task() {
        let store = MemoryStore::new();
        let result = stored_result(&store, "escrow opens monday").await;

        let receipt = recorder()
            .record(&store, &result, FeedbackAction::Accept)
            .await
            .unwrap();
        assert_eq!(receipt.examples_added, 2);
        assert_eq!(receipt.outcomes_recorded, 1);

        let window = TrainingWindow::default();
        let detection = store.examples(&ModelKey::detection("u1"), &window).await.unwrap();
        assert_eq!(detection.len(), 1);
        assert_eq!(detection[0].label, TRANSACTION_CLASS);
        assert_eq!(detection[0].label_source, LabelSource::User);
        assert_eq!(detection[0].result_id, Some(result.id));

        let types = store
            .examples(&ModelKey::transaction_type("u1"), &window)
            .await
            .unwrap();
        assert_eq!(types[0].label, "purchase");
    }

    #[tokio::test]
    async fn test_dismiss_replaces_provisional_outcome() {
        let store = MemoryStore::new();
        let mut result = stored_result(&store, "escrow opens monday").await;
        result.diagnostics.llm_is_transaction = Some(true);
        result.diagnostics.llm_confidence = Some(0.95);
        result.diagnostics.pattern_is_transaction = true;

        let recorder = recorder();
        let seeded = recorder
            .seed_from_llm(&store, &result, "escrow opens monday")
            .await
            .unwrap();
        assert_eq!(seeded, 1);

        let key = ModelKey::detection("u1");
        let provisional = recorder.metrics(&store, &key).await.unwrap();
        assert_eq!(provisional.len(), 1);
        assert_eq!(provisional.summary().accuracy, 1.0);

        recorder
            .record(&store, &result, FeedbackAction::Dismiss)
            .await
            .unwrap();
        let corrected = recorder.metrics(&store, &key).await.unwrap();
        assert_eq!(corrected.len(), 1);
        assert_eq!(corrected.counts().false_positive, 1);
        assert_eq!(corrected.outcomes().next().unwrap().source, LabelSource::User);
    }

    #[tokio::test]
    async fn test_no_seed_without_pattern_agreement() {
        let store = MemoryStore::new();
        let mut result = stored_result(&store, "quick question").await;
        result.tier = Tier::Learning;
        result.diagnostics.llm_is_transaction = Some(true);
        result.diagnostics.llm_confidence = Some(0.97);
        result.diagnostics.pattern_is_transaction = false;

        let seeded = recorder().seed_from_llm(&store, &result, "quick question").await.unwrap();
        assert_eq!(seeded, 0);

        result.diagnostics.pattern_is_transaction = true;
        result.diagnostics.llm_confidence = Some(0.70);
        let seeded = recorder().seed_from_llm(&store, &result, "quick question").await.unwrap();
        assert_eq!(seeded, 0);
    }

    #[tokio::test]
    async fn test_missing_features_is_error() {
        let store = MemoryStore::new();
        let result = ClassificationResult::filtered("u1", "m9", ThreadKey::Singleton("m9".into()));
        let err = recorder()
            .record(&store, &result, FeedbackAction::Accept)
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::FeaturesNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_feedback_keeps_every_outcome() {
        let store = FlakyStore::new(MemoryStore::new());
        store.slow_metrics_reads(std::time::Duration::from_millis(20));
        let first = stored_result(&store, "escrow opens monday").await;
        let second = stored_result(&store, "wire instructions attached").await;

        let recorder = recorder();
        let (a, b) = tokio::join!(
            recorder.record(&store, &first, FeedbackAction::Accept),
            recorder.record(&store, &second, FeedbackAction::Dismiss),
        );
        a.unwrap();
        b.unwrap();

        let metrics = recorder.metrics(&store, &ModelKey::detection("u1")).await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics.counts().true_positive, 1);
        assert_eq!(metrics.counts().false_positive, 1);
    }
}
