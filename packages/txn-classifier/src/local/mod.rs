//! Per-user local classifier.
//!
//! Each `ModelKey` (user + task) owns an independent TF-IDF vocabulary and
//! linear model. Snapshots live in the [`SnapshotStore`]; decoded models are
//! cached in a [`ModelRegistry`] on first use and evicted after inactivity.
//!
//! Inference and training are CPU-bound and run on tokio's blocking pool.

pub mod features;
pub mod model;
pub mod train;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ClassifierError, Result};
use crate::traits::store::{SnapshotStore, TrainingStore};
use crate::types::config::TrainingParams;
use crate::types::metrics::ModelMetrics;
use crate::types::training::{ModelKey, TrainingWindow};

pub use features::{SparseVector, Vocabulary};
pub use model::{ModelSnapshot, Prediction, SnapshotRecord};
pub use train::{train_model, TrainingSet};

/// Outcomes a new version needs before it can be judged a regression.
pub const ROLLBACK_MIN_OUTCOMES: usize = 20;

/// Accuracy drop versus the previous version that triggers rollback.
pub const ROLLBACK_ACCURACY_DROP: f32 = 0.05;

struct CachedModel {
    model: Arc<ModelSnapshot>,
    last_used: Instant,
}

/// Decoded models keyed by user and task.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<ModelKey, CachedModel>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached model, refreshing its idle timer.
    pub fn get(&self, key: &ModelKey) -> Option<Arc<ModelSnapshot>> {
        let mut models = self.models.write().unwrap();
        models.get_mut(key).map(|cached| {
            cached.last_used = Instant::now();
            cached.model.clone()
        })
    }

    pub fn insert(&self, model: ModelSnapshot) -> Arc<ModelSnapshot> {
        let model = Arc::new(model);
        self.models.write().unwrap().insert(
            model.key.clone(),
            CachedModel {
                model: model.clone(),
                last_used: Instant::now(),
            },
        );
        model
    }

    pub fn remove(&self, key: &ModelKey) {
        self.models.write().unwrap().remove(key);
    }

    /// Drop models unused for longer than `max_idle`. Returns the count.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let mut models = self.models.write().unwrap();
        let before = models.len();
        models.retain(|_, cached| cached.last_used.elapsed() <= max_idle);
        before - models.len()
    }

    pub fn len(&self) -> usize {
        self.models.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a training run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedSnapshot {
    pub key: ModelKey,
    pub version: i64,
    pub training_example_count: usize,
    pub vocabulary_size: usize,
    pub trained_at: chrono::DateTime<chrono::Utc>,
}

/// Loads, trains and rolls back per-user models.
pub struct LocalClassifier {
    registry: ModelRegistry,
    params: TrainingParams,
    window: TrainingWindow,
    llm_weight: f32,
}

impl LocalClassifier {
    pub fn new(params: TrainingParams, window: TrainingWindow, llm_weight: f32) -> Self {
        Self {
            registry: ModelRegistry::new(),
            params,
            window,
            llm_weight,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Current model for a key, loading it from the store on first use.
    ///
    /// Returns `ModelCorruption` when the stored snapshot cannot be decoded;
    /// the caller decides how to recover.
    pub async fn load<S: SnapshotStore + ?Sized>(
        &self,
        store: &S,
        key: &ModelKey,
    ) -> Result<Option<Arc<ModelSnapshot>>> {
        if let Some(model) = self.registry.get(key) {
            return Ok(Some(model));
        }
        let Some(record) = store.current_snapshot(key).await? else {
            return Ok(None);
        };
        let model = ModelSnapshot::from_record(&record)?;
        debug!(key = %key, version = model.version, "Loaded local model");
        Ok(Some(self.registry.insert(model)))
    }

    /// Classify many texts with one model in a single blocking task.
    pub async fn predict_many(
        &self,
        model: Arc<ModelSnapshot>,
        texts: Vec<String>,
    ) -> Result<Vec<Prediction>> {
        tokio::task::spawn_blocking(move || texts.iter().map(|t| model.predict(t)).collect())
            .await
            .map_err(ClassifierError::storage)
    }

    /// Whether enough new examples arrived since the current snapshot.
    pub async fn needs_retrain<S: SnapshotStore + TrainingStore + ?Sized>(
        &self,
        store: &S,
        key: &ModelKey,
        threshold: usize,
    ) -> Result<bool> {
        let since = store.current_snapshot(key).await?.map(|r| r.trained_at);
        let fresh = store.count_examples_since(key, since).await?;
        Ok(fresh >= threshold)
    }

    /// Retrain from the full rolling window and commit version + 1.
    pub async fn train<S: SnapshotStore + TrainingStore + ?Sized>(
        &self,
        store: &S,
        key: &ModelKey,
    ) -> Result<TrainedSnapshot> {
        let examples = store.examples(key, &self.window).await?;
        let version = store.latest_version(key).await? + 1;

        let classes = key.task.classes();
        let set = TrainingSet::from_examples(&examples, &classes, self.llm_weight);
        let params = self.params.clone();
        let train_key = key.clone();

        let started = Instant::now();
        let model = tokio::task::spawn_blocking(move || train_model(&train_key, version, &set, &params))
            .await
            .map_err(ClassifierError::storage)??;

        let record = model.to_record()?;
        store.commit_snapshot(record).await?;

        let trained = TrainedSnapshot {
            key: key.clone(),
            version,
            training_example_count: model.training_example_count,
            vocabulary_size: model.vocabulary.len(),
            trained_at: model.trained_at,
        };
        self.registry.insert(model);

        info!(
            key = %key,
            version,
            examples = trained.training_example_count,
            vocabulary = trained.vocabulary_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Committed local model snapshot"
        );
        Ok(trained)
    }

    /// Drop a corrupt current snapshot.
    pub async fn discard<S: SnapshotStore + ?Sized>(
        &self,
        store: &S,
        key: &ModelKey,
        version: i64,
    ) -> Result<()> {
        self.registry.remove(key);
        store.discard_snapshot(key, version).await
    }

    /// Restore the previous snapshot when the current one regressed.
    ///
    /// A version regresses once it has at least [`ROLLBACK_MIN_OUTCOMES`]
    /// outcomes and its accuracy is more than [`ROLLBACK_ACCURACY_DROP`]
    /// below the previous version's accuracy in the same window.
    pub async fn rollback_if_regressed<S: SnapshotStore + ?Sized>(
        &self,
        store: &S,
        key: &ModelKey,
        metrics: &ModelMetrics,
    ) -> Result<Option<i64>> {
        let (Some(current), Some(previous)) = (
            store.current_snapshot(key).await?,
            store.previous_snapshot(key).await?,
        ) else {
            return Ok(None);
        };

        let now = metrics.counts_for_version(current.version).summary();
        let before = metrics.counts_for_version(previous.version).summary();
        if now.evaluated < ROLLBACK_MIN_OUTCOMES || before.evaluated == 0 {
            return Ok(None);
        }
        if now.accuracy + ROLLBACK_ACCURACY_DROP >= before.accuracy {
            return Ok(None);
        }

        warn!(
            key = %key,
            from = current.version,
            to = previous.version,
            accuracy = now.accuracy,
            previous_accuracy = before.accuracy,
            "Local model regressed, rolling back"
        );
        self.registry.remove(key);
        Ok(store.rollback(key).await?.map(|r| r.version))
    }
}
