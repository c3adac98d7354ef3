//! In-memory storage and usage ledger.
//!
//! Useful for tests, the CLI and single-process deployments. Data is lost on
//! restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::Result;
use crate::local::model::SnapshotRecord;
use crate::traits::budget::{BudgetCap, Reservation, Usage, UsageLedger};
use crate::traits::store::{MetricsStore, ResultStore, SnapshotStore, TrainingStore};
use crate::types::{
    message::ThreadKey,
    metrics::ModelMetrics,
    result::ClassificationResult,
    training::{ModelKey, TrainingExample, TrainingWindow},
};

#[derive(Default)]
struct SnapshotSlots {
    current: Option<SnapshotRecord>,
    previous: Option<SnapshotRecord>,
    latest_version: i64,
}

/// In-memory implementation of every store trait.
pub struct MemoryStore {
    results: RwLock<Vec<ClassificationResult>>,
    examples: RwLock<HashMap<ModelKey, Vec<TrainingExample>>>,
    features: RwLock<HashMap<(String, String), String>>,
    snapshots: RwLock<HashMap<ModelKey, SnapshotSlots>>,
    metrics: RwLock<HashMap<ModelKey, ModelMetrics>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            results: RwLock::new(Vec::new()),
            examples: RwLock::new(HashMap::new()),
            features: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
        }
    }

    /// Number of persisted results, including superseded ones.
    pub fn result_count(&self) -> usize {
        self.results.read().unwrap().len()
    }

    /// Every persisted result in append order.
    pub fn all_results(&self) -> Vec<ClassificationResult> {
        self.results.read().unwrap().clone()
    }

    /// Number of examples for a key, ignoring the window.
    pub fn example_count(&self, key: &ModelKey) -> usize {
        self.examples
            .read()
            .unwrap()
            .get(key)
            .map_or(0, |examples| examples.len())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn save_result(&self, result: &ClassificationResult) -> Result<()> {
        self.results.write().unwrap().push(result.clone());
        Ok(())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ClassificationResult>> {
        Ok(self
            .results
            .read()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn latest_result(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<ClassificationResult>> {
        Ok(self
            .results
            .read()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.user_id == user_id && r.message_id == message_id)
            .cloned())
    }

    async fn result_history(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Vec<ClassificationResult>> {
        Ok(self
            .results
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.user_id == user_id && r.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn results_for_thread(
        &self,
        user_id: &str,
        thread_key: &ThreadKey,
    ) -> Result<Vec<ClassificationResult>> {
        let results = self.results.read().unwrap();
        let mut latest: indexmap::IndexMap<&str, &ClassificationResult> = indexmap::IndexMap::new();
        for result in results
            .iter()
            .filter(|r| r.user_id == user_id && &r.thread_key == thread_key)
        {
            latest.insert(result.message_id.as_str(), result);
        }
        Ok(latest.into_values().cloned().collect())
    }
}

#[async_trait]
impl TrainingStore for MemoryStore {
    async fn append_example(&self, example: &TrainingExample) -> Result<()> {
        self.examples
            .write()
            .unwrap()
            .entry(example.key.clone())
            .or_default()
            .push(example.clone());
        Ok(())
    }

    async fn examples(
        &self,
        key: &ModelKey,
        window: &TrainingWindow,
    ) -> Result<Vec<TrainingExample>> {
        let now = Utc::now();
        let examples = self.examples.read().unwrap();
        let mut admitted: Vec<TrainingExample> = examples
            .get(key)
            .map(|all| {
                all.iter()
                    .filter(|e| window.admits(e.created_at, now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        admitted.sort_by_key(|e| e.created_at);
        let skip = admitted.len().saturating_sub(window.max_examples);
        Ok(admitted.split_off(skip))
    }

    async fn count_examples_since(
        &self,
        key: &ModelKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        Ok(self.examples.read().unwrap().get(key).map_or(0, |all| {
            all.iter()
                .filter(|e| since.map_or(true, |since| e.created_at > since))
                .count()
        }))
    }

    async fn put_features(&self, user_id: &str, features_ref: &str, text: &str) -> Result<()> {
        self.features
            .write()
            .unwrap()
            .insert((user_id.to_string(), features_ref.to_string()), text.to_string());
        Ok(())
    }

    async fn get_features(&self, user_id: &str, features_ref: &str) -> Result<Option<String>> {
        Ok(self
            .features
            .read()
            .unwrap()
            .get(&(user_id.to_string(), features_ref.to_string()))
            .cloned())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn current_snapshot(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>> {
        Ok(self
            .snapshots
            .read()
            .unwrap()
            .get(key)
            .and_then(|slots| slots.current.clone()))
    }

    async fn previous_snapshot(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>> {
        Ok(self
            .snapshots
            .read()
            .unwrap()
            .get(key)
            .and_then(|slots| slots.previous.clone()))
    }

    async fn latest_version(&self, key: &ModelKey) -> Result<i64> {
        Ok(self
            .snapshots
            .read()
            .unwrap()
            .get(key)
            .map_or(0, |slots| slots.latest_version))
    }

    async fn commit_snapshot(&self, record: SnapshotRecord) -> Result<()> {
        let mut snapshots = self.snapshots.write().unwrap();
        let slots = snapshots.entry(record.key.clone()).or_default();
        slots.latest_version = slots.latest_version.max(record.version);
        slots.previous = slots.current.take();
        slots.current = Some(record);
        Ok(())
    }

    async fn discard_snapshot(&self, key: &ModelKey, version: i64) -> Result<()> {
        let mut snapshots = self.snapshots.write().unwrap();
        if let Some(slots) = snapshots.get_mut(key) {
            if slots.current.as_ref().is_some_and(|r| r.version == version) {
                slots.current = None;
            }
        }
        Ok(())
    }

    async fn rollback(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>> {
        let mut snapshots = self.snapshots.write().unwrap();
        let Some(slots) = snapshots.get_mut(key) else {
            return Ok(None);
        };
        let Some(previous) = slots.previous.take() else {
            return Ok(None);
        };
        slots.current = Some(previous.clone());
        Ok(Some(previous))
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn load_metrics(&self, key: &ModelKey) -> Result<Option<ModelMetrics>> {
        Ok(self.metrics.read().unwrap().get(key).cloned())
    }

    async fn save_metrics(&self, key: &ModelKey, metrics: &ModelMetrics) -> Result<()> {
        self.metrics
            .write()
            .unwrap()
            .insert(key.clone(), metrics.clone());
        Ok(())
    }
}

/// In-memory usage ledger with atomic reservations.
#[derive(Default)]
pub struct MemoryUsageLedger {
    usage: Mutex<HashMap<(String, String), Usage>>,
}

impl MemoryUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit usage directly (e.g. usage billed outside the pipeline).
    pub fn record(&self, user_id: &str, period: &str, tokens: u64) {
        self.usage
            .lock()
            .unwrap()
            .entry((user_id.to_string(), period.to_string()))
            .or_default()
            .committed_tokens += tokens;
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn usage(&self, user_id: &str, period: &str) -> Result<Usage> {
        Ok(self
            .usage
            .lock()
            .unwrap()
            .get(&(user_id.to_string(), period.to_string()))
            .copied()
            .unwrap_or_default())
    }

    async fn try_reserve(
        &self,
        user_id: &str,
        period: &str,
        tokens: u64,
        cap: &BudgetCap,
    ) -> Result<Option<Reservation>> {
        let mut usage = self.usage.lock().unwrap();
        let entry = usage
            .entry((user_id.to_string(), period.to_string()))
            .or_default();
        if !cap.admits(entry, tokens) {
            return Ok(None);
        }
        entry.reserved_tokens += tokens;
        Ok(Some(Reservation {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            period: period.to_string(),
            tokens,
        }))
    }

    async fn settle(&self, reservation: Reservation, actual_tokens: u64) -> Result<()> {
        let mut usage = self.usage.lock().unwrap();
        let entry = usage
            .entry((reservation.user_id, reservation.period))
            .or_default();
        entry.reserved_tokens = entry.reserved_tokens.saturating_sub(reservation.tokens);
        entry.committed_tokens += actual_tokens;
        Ok(())
    }
}
