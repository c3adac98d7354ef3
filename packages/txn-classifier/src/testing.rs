//! Testing utilities including mock implementations.
//!
//! These let applications exercise the pipeline without real LLM calls or a
//! real database.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AnalyzerError, AnalyzerResult, ClassifierError, Result};
use crate::local::model::SnapshotRecord;
use crate::pipeline::prompts::{BatchResponse, ItemVerdict};
use crate::traits::llm::{LlmBackend, LlmBatch, LlmCompletion, TokenUsage};
use crate::traits::store::{MetricsStore, ResultStore, SnapshotStore, TrainingStore};
use crate::types::{
    message::{Message, ThreadKey},
    metrics::ModelMetrics,
    result::ClassificationResult,
    training::{ModelKey, TrainingExample, TrainingWindow},
};

/// Phrases the mock treats as transaction evidence, with a type hint.
const MOCK_SIGNALS: &[(&str, &str)] = &[
    ("escrow", "purchase"),
    ("offer", "purchase"),
    ("closing", "purchase"),
    ("earnest money", "purchase"),
    ("listing agreement", "sale"),
    ("lease", "lease"),
    ("refinance", "refinance"),
    ("inspection", "purchase"),
];

/// Record of one call to the mock.
#[derive(Debug, Clone)]
pub struct MockLlmCall {
    pub user_id: String,
    pub item_ids: Vec<String>,
}

/// A deterministic [`LlmBackend`].
///
/// By default an item is a transaction when its text mentions escrow,
/// offers, closings, leases or refinancing, with confidence 0.92.
#[derive(Default)]
pub struct MockLlm {
    confidence: f32,
    overrides: Arc<RwLock<HashMap<String, ItemVerdict>>>,
    omitted: Arc<RwLock<Vec<String>>>,
    failure: Arc<RwLock<Option<(AnalyzerError, Option<usize>)>>>,
    delay: Option<std::time::Duration>,
    tokens_per_item: Option<u64>,
    cancel_after: Option<(usize, CancellationToken)>,
    calls: Arc<RwLock<Vec<MockLlmCall>>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            confidence: 0.92,
            ..Default::default()
        }
    }

    /// Confidence of keyword-derived verdicts.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Fixed verdict for one message id.
    pub fn with_verdict(self, id: impl Into<String>, is_transaction: bool, confidence: f32) -> Self {
        let id = id.into();
        self.overrides.write().unwrap().insert(
            id.clone(),
            ItemVerdict {
                id,
                is_transaction,
                confidence,
                transaction_type: None,
                entities: None,
            },
        );
        self
    }

    /// Leave a message id out of every response.
    pub fn omitting(self, id: impl Into<String>) -> Self {
        self.omitted.write().unwrap().push(id.into());
        self
    }

    /// Fail every call with `error`.
    pub fn failing(self, error: AnalyzerError) -> Self {
        *self.failure.write().unwrap() = Some((error, None));
        self
    }

    /// Fail the next `times` calls with `error`, then succeed.
    pub fn failing_times(self, times: usize, error: AnalyzerError) -> Self {
        *self.failure.write().unwrap() = Some((error, Some(times)));
        self
    }

    /// Sleep before answering (for timeout tests).
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Report provider usage of `tokens` per item.
    pub fn with_usage(mut self, tokens: u64) -> Self {
        self.tokens_per_item = Some(tokens);
        self
    }

    /// Cancel `token` once `calls` calls have completed.
    pub fn cancel_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn calls(&self) -> Vec<MockLlmCall> {
        self.calls.read().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.read().unwrap().len()
    }

    /// Total items across all calls.
    pub fn items_seen(&self) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .map(|c| c.item_ids.len())
            .sum()
    }

    fn next_failure(&self) -> Option<AnalyzerError> {
        let mut failure = self.failure.write().unwrap();
        match failure.as_mut() {
            None => None,
            Some((error, None)) => Some(error.clone()),
            Some((_, Some(0))) => None,
            Some((error, Some(remaining))) => {
                *remaining -= 1;
                Some(error.clone())
            }
        }
    }

    fn verdict_for(&self, id: &str, text: &str) -> ItemVerdict {
        if let Some(verdict) = self.overrides.read().unwrap().get(id) {
            return verdict.clone();
        }
        let lower = text.to_lowercase();
        let hint = MOCK_SIGNALS
            .iter()
            .find(|(phrase, _)| lower.contains(phrase))
            .map(|(_, kind)| kind.to_string());
        ItemVerdict {
            id: id.to_string(),
            is_transaction: hint.is_some(),
            confidence: self.confidence,
            transaction_type: hint,
            entities: None,
        }
    }
}

#[async_trait]
impl LlmBackend for MockLlm {
    fn model_id(&self) -> &str {
        "mock-llm"
    }

    async fn complete(&self, batch: &LlmBatch) -> AnalyzerResult<LlmCompletion> {
        self.calls.write().unwrap().push(MockLlmCall {
            user_id: batch.user_id.clone(),
            item_ids: batch.items.iter().map(|i| i.id.clone()).collect(),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.next_failure();
        if let Some((after, token)) = &self.cancel_after {
            if self.call_count() >= *after {
                token.cancel();
            }
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let omitted = self.omitted.read().unwrap().clone();
        let response = BatchResponse {
            results: batch
                .items
                .iter()
                .filter(|item| !omitted.contains(&item.id))
                .map(|item| self.verdict_for(&item.id, item.text.as_str()))
                .collect(),
        };
        let content = serde_json::to_string(&response)
            .map_err(|e| AnalyzerError::Malformed(e.to_string()))?;

        Ok(LlmCompletion {
            content,
            usage: self.tokens_per_item.map(|tokens| TokenUsage {
                prompt_tokens: tokens * batch.len() as u64,
                completion_tokens: 0,
            }),
        })
    }
}

/// Store wrapper whose result writes can be made to fail and whose metrics
/// reads can be made slow.
pub struct FlakyStore<S> {
    inner: S,
    failing_saves: AtomicUsize,
    metrics_read_delay: RwLock<Option<std::time::Duration>>,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            failing_saves: AtomicUsize::new(0),
            metrics_read_delay: RwLock::new(None),
        }
    }

    /// Pause after every metrics read, before returning the value.
    pub fn slow_metrics_reads(&self, delay: std::time::Duration) {
        *self.metrics_read_delay.write().unwrap() = Some(delay);
    }

    /// Fail the next `n` result writes.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn should_fail(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<S: ResultStore> ResultStore for FlakyStore<S> {
    async fn save_result(&self, result: &ClassificationResult) -> Result<()> {
        if self.should_fail() {
            return Err(ClassifierError::storage("injected write failure"));
        }
        self.inner.save_result(result).await
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ClassificationResult>> {
        self.inner.get_result(id).await
    }

    async fn latest_result(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<ClassificationResult>> {
        self.inner.latest_result(user_id, message_id).await
    }

    async fn result_history(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Vec<ClassificationResult>> {
        self.inner.result_history(user_id, message_id).await
    }

    async fn results_for_thread(
        &self,
        user_id: &str,
        thread_key: &ThreadKey,
    ) -> Result<Vec<ClassificationResult>> {
        self.inner.results_for_thread(user_id, thread_key).await
    }
}

#[async_trait]
impl<S: TrainingStore> TrainingStore for FlakyStore<S> {
    async fn append_example(&self, example: &TrainingExample) -> Result<()> {
        self.inner.append_example(example).await
    }

    async fn examples(
        &self,
        key: &ModelKey,
        window: &TrainingWindow,
    ) -> Result<Vec<TrainingExample>> {
        self.inner.examples(key, window).await
    }

    async fn count_examples_since(
        &self,
        key: &ModelKey,
        since: Option<DateTime<Utc>>,
    ) -> Result<usize> {
        self.inner.count_examples_since(key, since).await
    }

    async fn put_features(&self, user_id: &str, features_ref: &str, text: &str) -> Result<()> {
        self.inner.put_features(user_id, features_ref, text).await
    }

    async fn get_features(&self, user_id: &str, features_ref: &str) -> Result<Option<String>> {
        self.inner.get_features(user_id, features_ref).await
    }
}

#[async_trait]
impl<S: SnapshotStore> SnapshotStore for FlakyStore<S> {
    async fn current_snapshot(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>> {
        self.inner.current_snapshot(key).await
    }

    async fn previous_snapshot(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>> {
        self.inner.previous_snapshot(key).await
    }

    async fn latest_version(&self, key: &ModelKey) -> Result<i64> {
        self.inner.latest_version(key).await
    }

    async fn commit_snapshot(&self, record: SnapshotRecord) -> Result<()> {
        self.inner.commit_snapshot(record).await
    }

    async fn discard_snapshot(&self, key: &ModelKey, version: i64) -> Result<()> {
        self.inner.discard_snapshot(key, version).await
    }

    async fn rollback(&self, key: &ModelKey) -> Result<Option<SnapshotRecord>> {
        self.inner.rollback(key).await
    }
}

#[async_trait]
impl<S: MetricsStore> MetricsStore for FlakyStore<S> {
    async fn load_metrics(&self, key: &ModelKey) -> Result<Option<ModelMetrics>> {
        let metrics = self.inner.load_metrics(key).await;
        let delay = *self.metrics_read_delay.read().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        metrics
    }

    async fn save_metrics(&self, key: &ModelKey, metrics: &ModelMetrics) -> Result<()> {
        self.inner.save_metrics(key, metrics).await
    }
}

/// Message fixtures.
pub mod fixtures {
    use super::*;

    fn base_time() -> DateTime<Utc> {
        Utc::now() - Duration::days(1)
    }

    /// A purchase-transaction email.
    pub fn transaction_message(id: &str) -> Message {
        Message::new(
            id,
            "Offer accepted - 42 Maple Street",
            "Great news, the sellers accepted your offer. Escrow opens Monday and \
             the title company will send wire instructions for the earnest money.",
            base_time(),
        )
        .from_domain("dotloop.com")
    }

    /// A marketing newsletter.
    pub fn newsletter_message(id: &str) -> Message {
        Message::new(
            id,
            "Your weekly market report",
            "Home values are up this quarter. Join our webinar on staging tips. \
             Unsubscribe any time.",
            base_time(),
        )
        .from_domain("news.example.com")
    }

    /// `count` messages in one thread, one minute apart, earliest first.
    pub fn thread(thread_id: &str, count: usize) -> Vec<Message> {
        let start = base_time();
        (0..count)
            .map(|i| {
                let mut message = transaction_message(&format!("{thread_id}-{i:03}"))
                    .in_thread(thread_id);
                message.sent_at = start + Duration::minutes(i as i64);
                if i > 0 {
                    message.subject = format!("Re: {}", message.subject);
                }
                message
            })
            .collect()
    }

    /// `count` singleton messages alternating between transactions and
    /// newsletters.
    pub fn mixed_inbox(count: usize) -> Vec<Message> {
        (0..count)
            .map(|i| {
                let id = format!("m{i:04}");
                if i % 2 == 0 {
                    transaction_message(&id)
                } else {
                    newsletter_message(&id)
                }
            })
            .collect()
    }
}
