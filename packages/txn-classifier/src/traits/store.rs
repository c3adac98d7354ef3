//! Persistence traits for results, training data, snapshots and metrics.
//!
//! The storage layer is split into focused traits:
//! - `ResultStore`: append-only classification history
//! - `TrainingStore`: training examples and sanitized feature texts
//! - `SnapshotStore`: current + previous model snapshot per model key
//! - `MetricsStore`: rolling-window metrics per model key
//! - `ClassifierStore`: composite trait combining all four

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::local::model::SnapshotRecord;
use crate::types::{
    message::ThreadKey,
    metrics::ModelMetrics,
    result::ClassificationResult,
    training::{ModelKey, TrainingExample, TrainingWindow},
};

/// Append-only store for classification results.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Append a result. Results are never updated in place.
    async fn save_result(&self, result: &ClassificationResult) -> Result<()>;

    /// Get a result by id.
    async fn get_result(&self, id: Uuid) -> Result<Option<ClassificationResult>>;

    /// Most recent result for a message.
    async fn latest_result(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<ClassificationResult>>;

    /// Every result for a message, oldest first.
    async fn result_history(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Vec<ClassificationResult>>;

    /// Latest result of each message in a thread.
    async fn results_for_thread(
        &self,
        user_id: &str,
        thread_key: &ThreadKey,
    ) -> Result<Vec<ClassificationResult>>;
}

/// Store for training examples and the feature texts they reference.
#[async_trait]
pub trait TrainingStore: Send + Sync {
    /// Append a training example.
    async fn append_example(&self, example: &TrainingExample) -> Result<()>;

    /// Examples inside the rolling window, oldest first.
    async fn examples(
        &self,
        key: &ModelKey,
        window: &TrainingWindow,
    ) -> Result<Vec<TrainingExample>>;

    /// Number of examples inside the rolling window.
    async fn count_examples(&self, key: &ModelKey, window: &TrainingWindow) -> Result<usize> {
        Ok(self.examples(key, window).await?.len())
    }

    /// Number of examples created after `since` (all examples when None).
    async fn count_examples_since(
        &self,
        key: &ModelKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize>;

    /// Store sanitized feature text under its content reference.
    async fn put_features(&self, user_id: &str, features_ref: &str, text: &str) -> Result<()>;

    /// Load feature text by reference.
    async fn get_features(&self, user_id: &str, features_ref: &str) -> Result<Option<String>>;
}

/// Store for model snapshots. Keeps the current and one previous generation.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn current_snapshot(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>>;

    async fn previous_snapshot(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>>;

    /// Highest version ever committed for a key (0 when none). Versions
    /// are never reused, even after a discard or rollback.
    async fn latest_version(&self, key: &ModelKey) -> Result<i64>;

    /// Make `record` current; the old current becomes previous.
    async fn commit_snapshot(&self, record: SnapshotRecord) -> Result<()>;

    /// Drop the current snapshot if it has the given version.
    async fn discard_snapshot(&self, key: &ModelKey, version: i64) -> Result<()>;

    /// Restore the previous snapshot as current, dropping the current one.
    ///
    /// Returns the restored record, or None when there is nothing to restore.
    async fn rollback(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>>;
}

/// Store for rolling-window metrics.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn load_metrics(&self, key: &ModelKey) -> Result<Option<ModelMetrics>>;

    async fn save_metrics(&self, key: &ModelKey, metrics: &ModelMetrics) -> Result<()>;
}

/// Composite storage trait used by the orchestrator.
pub trait ClassifierStore: ResultStore + TrainingStore + SnapshotStore + MetricsStore {}

impl<T: ResultStore + TrainingStore + SnapshotStore + MetricsStore> ClassifierStore for T {}
