//! End-to-end classification pass.
//!
//! flush uncommitted → filter → group threads → lock threads → tier →
//! join threads stored by earlier passes → pattern → local (tier ≥ 2) →
//! route → batched LLM → aggregate → propagate → persist → seed feedback →
//! schedule retraining.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AnalyzerError, ClassifierError, Result, SanitizeError, TrainingError};
use crate::local::{LocalClassifier, ModelSnapshot, Prediction, TrainedSnapshot};
use crate::pipeline::aggregate::{AggregateInput, Authority, ConfidenceAggregator, EngineVote};
use crate::pipeline::analyzer::{AnalyzerSettings, AnalyzerStats, LlmAnalyzer, LlmVerdict};
use crate::pipeline::feedback::{FeedbackAction, FeedbackReceipt, FeedbackRecorder};
use crate::pipeline::filter::IngestionFilter;
use crate::pipeline::graduation::{GraduationPolicy, GraduationStatus};
use crate::pipeline::locks::KeyedLocks;
use crate::pipeline::patterns::{PatternMatcher, PatternScore};
use crate::pipeline::sanitize::{compose, truncate, ContentSanitizer, SanitizedText};
use crate::pipeline::threads::{ThreadIndex, ThreadView};
use crate::traits::budget::{budget_period, UsageLedger};
use crate::traits::llm::{BatchItem, LlmBackend, LlmBatch};
use crate::traits::store::ClassifierStore;
use crate::types::config::ClassifierConfig;
use crate::types::message::{Message, ThreadKey};
use crate::types::result::{
    ClassificationResult, Engine, ResultDiagnostics, ResultOrigin, SourceScores,
};
use crate::types::tier::Tier;
use crate::types::training::{features_ref, ModelKey, TaskType, TransactionType, TRANSACTION_CLASS};

/// Something the caller should surface once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanNotice {
    /// LLM budget spent; pattern-only until the period rolls over
    BudgetExceeded { user_id: String, period: String },
    /// A corrupt snapshot was discarded and metrics were reset
    ModelReset {
        key: ModelKey,
        version: i64,
        reason: String,
    },
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub messages: usize,
    pub filtered: usize,
    pub threads: usize,
    pub local_decisions: usize,
    pub llm_items: usize,
    pub llm_batches: usize,
    pub fallbacks: usize,
    pub propagated: usize,
    /// Messages from earlier passes re-pointed at a new representative
    pub repropagated: usize,
    pub persisted: usize,
    /// Held-over results persisted at the start of this pass
    pub flushed: usize,
}

/// Output of a classification pass.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    /// One result per classified message, in input order
    pub results: Vec<ClassificationResult>,
    /// Messages not classified because the pass was cancelled
    pub skipped: Vec<String>,
    /// Results that could not be persisted yet; retried on the next pass
    pub uncommitted: Vec<Uuid>,
    pub notices: Vec<ScanNotice>,
    pub stats: ScanStats,
    pub cancelled: bool,
}

impl ScanOutcome {
    /// Result for a message, if it was classified.
    pub fn result_for(&self, message_id: &str) -> Option<&ClassificationResult> {
        self.results.iter().find(|r| r.message_id == message_id)
    }
}

/// A result waiting to be written with the feature text it references.
#[derive(Debug, Clone)]
struct PendingWrite {
    result: ClassificationResult,
    features: Option<String>,
}

#[derive(Clone, Copy)]
enum Route {
    Local,
    Llm,
    Fallback(&'static str),
}

struct Candidate<'a> {
    message: &'a Message,
    pattern: PatternScore,
    sanitized: std::result::Result<SanitizedText, SanitizeError>,
    /// Text for in-process models and stored features
    features: String,
    local: Option<Prediction>,
    local_type: Option<Prediction>,
}

impl Candidate<'_> {
    fn local_is_transaction(&self) -> Option<bool> {
        self.local.as_ref().map(|p| p.class == TRANSACTION_CLASS)
    }
}

/// State of one task at the start of a pass.
struct TaskState {
    tier: Tier,
    model: Option<Arc<ModelSnapshot>>,
}

/// Hybrid classification pipeline for many users.
pub struct Orchestrator<S: ClassifierStore + 'static, B: LlmBackend + 'static> {
    store: Arc<S>,
    analyzer: LlmAnalyzer<B>,
    local: Arc<LocalClassifier>,
    config: ClassifierConfig,
    filter: IngestionFilter,
    sanitizer: ContentSanitizer,
    patterns: PatternMatcher,
    aggregator: ConfidenceAggregator,
    policy: GraduationPolicy,
    feedback: FeedbackRecorder,
    thread_locks: KeyedLocks<(String, ThreadKey)>,
    training_locks: Arc<KeyedLocks<ModelKey>>,
    training_tasks: Mutex<Vec<JoinHandle<()>>>,
    uncommitted: Mutex<Vec<PendingWrite>>,
}

impl<S: ClassifierStore + 'static, B: LlmBackend + 'static> Orchestrator<S, B> {
    /// Build an orchestrator. Fails on invalid configuration.
    pub fn new(
        store: Arc<S>,
        backend: Arc<B>,
        ledger: Arc<dyn UsageLedger>,
        config: ClassifierConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            analyzer: LlmAnalyzer::new(backend, ledger, AnalyzerSettings::from_config(&config)),
            local: Arc::new(LocalClassifier::new(
                config.training.clone(),
                config.training_window,
                config.llm_example_weight,
            )),
            filter: IngestionFilter::new(&config.extra_junk_labels),
            sanitizer: ContentSanitizer::new(),
            patterns: PatternMatcher::new(),
            aggregator: ConfidenceAggregator::new(),
            policy: GraduationPolicy::new(config.tier_floors.clone()),
            feedback: FeedbackRecorder::new(config.llm_seed_confidence, config.metrics_window),
            thread_locks: KeyedLocks::new(),
            training_locks: Arc::new(KeyedLocks::new()),
            training_tasks: Mutex::new(Vec::new()),
            uncommitted: Mutex::new(Vec::new()),
            config,
        })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// LLM request and item counters since startup.
    pub fn analyzer_stats(&self) -> AnalyzerStats {
        self.analyzer.stats()
    }

    /// Results still waiting to be persisted.
    pub fn uncommitted_count(&self) -> usize {
        self.uncommitted.lock().unwrap().len()
    }

    /// Classify a batch of messages for one user.
    pub async fn classify(&self, user_id: &str, messages: &[Message]) -> Result<ScanOutcome> {
        self.classify_with_cancel(user_id, messages, CancellationToken::new())
            .await
    }

    /// Classify with cooperative cancellation. No LLM batch is issued once
    /// `cancel` fires; messages that needed one are reported as skipped.
    pub async fn classify_with_cancel(
        &self,
        user_id: &str,
        messages: &[Message],
        cancel: CancellationToken,
    ) -> Result<ScanOutcome> {
        self.run_pass(user_id, messages, cancel, true).await
    }

    /// Classify one message on its own, superseding its latest result.
    ///
    /// The message is its own representative, so a sibling re-classified
    /// here may diverge from the rest of its thread.
    pub async fn reclassify(&self, user_id: &str, message: &Message) -> Result<ClassificationResult> {
        let outcome = self
            .run_pass(user_id, std::slice::from_ref(message), CancellationToken::new(), false)
            .await?;
        outcome
            .results
            .into_iter()
            .find(|r| r.message_id == message.id)
            .ok_or(ClassifierError::Cancelled)
    }

    /// One pass. With `join_stored_threads`, messages of threads classified
    /// in earlier passes follow the stored representative.
    async fn run_pass(
        &self,
        user_id: &str,
        messages: &[Message],
        cancel: CancellationToken,
        join_stored_threads: bool,
    ) -> Result<ScanOutcome> {
        let started = Instant::now();
        let mut outcome = ScanOutcome::default();
        outcome.stats.messages = messages.len();
        outcome.stats.flushed = self.flush_uncommitted().await;

        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut writes = Vec::new();
        for message in messages {
            if !seen.insert(message.id.as_str()) {
                continue;
            }
            if let Some(label) = self.filter.matched_label(message) {
                debug!(user_id, message_id = %message.id, label, "Filtered junk message");
                let features = self.feature_text(message);
                let mut result = ClassificationResult::filtered(
                    user_id,
                    &message.id,
                    ThreadKey::for_message(message),
                );
                result.sent_at = message.sent_at;
                result.features_ref = Some(features_ref(&features));
                writes.push(PendingWrite {
                    result,
                    features: Some(features),
                });
                outcome.stats.filtered += 1;
            } else {
                kept.push(message.clone());
            }
        }

        let index = ThreadIndex::build(&kept);
        let views = index.views(&kept);
        outcome.stats.threads = views.len();

        let lock_keys: Vec<(String, ThreadKey)> = index
            .keys()
            .map(|key| (user_id.to_string(), key.clone()))
            .collect();
        let _guards = self.thread_locks.lock_all(lock_keys.iter()).await;

        // Threads whose stored representative predates every new message
        // are answered from it without analysis.
        let mut fresh: Vec<(ThreadView, Vec<ClassificationResult>)> = Vec::new();
        for view in views {
            let stored = if join_stored_threads {
                self.stored_thread(user_id, view.key).await
            } else {
                Vec::new()
            };
            let joined = stored_representative(&stored)
                .filter(|r| precedes(r, view.representative()))
                .cloned();
            match joined {
                Some(representative) => {
                    debug!(
                        user_id,
                        thread = %view.key,
                        representative = %representative.message_id,
                        messages = view.len(),
                        "Joined thread classified in an earlier pass"
                    );
                    for message in &view.messages {
                        writes.push(self.propagated_write(&representative, message));
                        outcome.stats.propagated += 1;
                    }
                }
                None => fresh.push((view, stored)),
            }
        }

        let detection = self
            .task_state(&ModelKey::detection(user_id), &mut outcome.notices)
            .await;
        let kind = self
            .task_state(&ModelKey::transaction_type(user_id), &mut outcome.notices)
            .await;
        let tier = detection.tier;

        let max_chars = self.config.max_chars_per_message;
        let mut candidates: Vec<Candidate> = fresh
            .iter()
            .map(|(view, _)| {
                let message = view.representative();
                let sanitized = self.sanitizer.sanitize_message(message, max_chars);
                let features = match &sanitized {
                    Ok(text) => text.as_str().to_string(),
                    Err(_) => truncate(compose(message), max_chars),
                };
                Candidate {
                    message,
                    pattern: self.patterns.score(message),
                    sanitized,
                    features,
                    local: None,
                    local_type: None,
                }
            })
            .collect();

        if tier.invokes_local() {
            if let Some(model) = detection.model.clone() {
                let texts = candidates.iter().map(|c| c.features.clone()).collect();
                match self.local.predict_many(model, texts).await {
                    Ok(predictions) => {
                        for (candidate, prediction) in candidates.iter_mut().zip(predictions) {
                            candidate.local = Some(prediction);
                        }
                    }
                    Err(e) => warn!(user_id, error = %e, "Local detection inference failed"),
                }
            }
        }
        if kind.tier.invokes_local() {
            if let Some(model) = kind.model.clone() {
                let texts = candidates.iter().map(|c| c.features.clone()).collect();
                match self.local.predict_many(model, texts).await {
                    Ok(predictions) => {
                        for (candidate, prediction) in candidates.iter_mut().zip(predictions) {
                            candidate.local_type = Some(prediction);
                        }
                    }
                    Err(e) => warn!(user_id, error = %e, "Local type inference failed"),
                }
            }
        }

        let budget_blocked = match self.analyzer.budget_exhausted(user_id).await {
            Ok(exhausted) => exhausted,
            Err(e) => {
                warn!(user_id, error = %e, "Budget check failed");
                false
            }
        };
        if budget_blocked {
            self.push_budget_notice(user_id, &budget_period(chrono::Utc::now()), &mut outcome.notices);
        }

        let cutoff = tier.behavior().local_cutoff(self.config.confidence_threshold);
        let routes: Vec<Route> = candidates
            .iter()
            .map(|c| match (cutoff, &c.local) {
                (Some(cut), Some(prediction)) if prediction.confidence >= cut => Route::Local,
                _ if budget_blocked => Route::Fallback("budget_exceeded"),
                _ if c.sanitized.is_err() => Route::Fallback("sanitize"),
                _ => Route::Llm,
            })
            .collect();

        let llm_bound: Vec<usize> = routes
            .iter()
            .enumerate()
            .filter(|(_, route)| matches!(route, Route::Llm))
            .map(|(i, _)| i)
            .collect();
        let (verdicts, skipped) = self
            .analyze(user_id, &candidates, &llm_bound, &cancel, &mut outcome)
            .await;

        let type_cutoff = kind.tier.behavior().local_cutoff(self.config.confidence_threshold);
        let mut decided: HashMap<String, ClassificationResult> = HashMap::new();
        let mut seeds: Vec<(ClassificationResult, String)> = Vec::new();

        for (i, ((view, stored), candidate)) in fresh.iter().zip(&candidates).enumerate() {
            if skipped.contains(&i) {
                outcome
                    .skipped
                    .extend(view.messages.iter().map(|m| m.id.clone()));
                continue;
            }
            let verdict = verdicts.get(&i);
            let route = match (routes[i], verdict) {
                (Route::Llm, Some(Err(e))) => Route::Fallback(e.kind()),
                (Route::Llm, None) => Route::Fallback("unavailable"),
                (route, _) => route,
            };
            let mut result = self.decide(
                user_id,
                tier,
                type_cutoff,
                candidate,
                &route,
                verdict.and_then(|v| v.as_ref().ok()),
            );
            result.thread_key = view.key.clone();
            match route {
                Route::Local => outcome.stats.local_decisions += 1,
                Route::Fallback(_) => outcome.stats.fallbacks += 1,
                Route::Llm => {}
            }

            if candidate.sanitized.is_ok() && result.diagnostics.llm_confidence.is_some() {
                seeds.push((result.clone(), candidate.features.clone()));
            }

            for sibling in view.siblings() {
                writes.push(self.propagated_write(&result, sibling));
                outcome.stats.propagated += 1;
            }

            // Stored messages of this thread follow the new representative,
            // except those classified on their own.
            let in_pass = index.message_ids(view.key, &kept);
            let previous = stored_representative(stored).map(|r| r.id);
            for earlier in stored
                .iter()
                .filter(|r| !in_pass.contains(&r.message_id.as_str()))
                .filter(|r| r.is_propagated() || Some(r.id) == previous)
            {
                let mut copy = result.propagate_to(&earlier.message_id, earlier.sent_at);
                copy.features_ref = earlier.features_ref.clone();
                copy.supersedes = Some(earlier.id);
                writes.push(PendingWrite {
                    result: copy,
                    features: None,
                });
                outcome.stats.repropagated += 1;
            }

            writes.push(PendingWrite {
                result,
                features: Some(candidate.features.clone()),
            });
        }

        for mut write in writes {
            if write.result.supersedes.is_none() {
                match self
                    .store
                    .latest_result(user_id, &write.result.message_id)
                    .await
                {
                    Ok(previous) => write.result.supersedes = previous.map(|r| r.id),
                    Err(e) => warn!(user_id, error = %e, "Could not look up previous result"),
                }
            }
            if self.persist_with_retry(&write).await {
                outcome.stats.persisted += 1;
            } else {
                outcome.uncommitted.push(write.result.id);
                self.uncommitted.lock().unwrap().push(write.clone());
            }
            decided.insert(write.result.message_id.clone(), write.result);
        }

        for (result, text) in seeds {
            if let Err(e) = self
                .feedback
                .seed_from_llm(self.store.as_ref(), &result, &text)
                .await
            {
                warn!(user_id, result_id = %result.id, error = %e, "Failed to seed training data");
            }
        }

        let mut emitted = HashSet::new();
        for message in messages {
            if !emitted.insert(message.id.as_str()) {
                continue;
            }
            if let Some(result) = decided.remove(&message.id) {
                outcome.results.push(result);
            }
        }
        outcome.cancelled = cancel.is_cancelled();

        drop(_guards);
        if self.config.auto_retrain {
            self.schedule_retraining(user_id).await;
        }

        info!(
            user_id,
            tier = %tier,
            messages = outcome.stats.messages,
            threads = outcome.stats.threads,
            filtered = outcome.stats.filtered,
            llm_items = outcome.stats.llm_items,
            local = outcome.stats.local_decisions,
            fallbacks = outcome.stats.fallbacks,
            propagated = outcome.stats.propagated,
            repropagated = outcome.stats.repropagated,
            skipped = outcome.skipped.len(),
            uncommitted = outcome.uncommitted.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classification pass complete"
        );
        Ok(outcome)
    }

    /// Apply a user action to a result, then check the affected models for
    /// regression.
    pub async fn record_feedback(
        &self,
        result_id: Uuid,
        action: FeedbackAction,
    ) -> Result<FeedbackReceipt> {
        let result = self
            .store
            .get_result(result_id)
            .await?
            .ok_or(ClassifierError::ResultNotFound { id: result_id })?;

        let mut receipt = self.feedback.record(self.store.as_ref(), &result, action).await?;

        for key in [
            ModelKey::detection(&result.user_id),
            ModelKey::transaction_type(&result.user_id),
        ] {
            let metrics = self.feedback.metrics(self.store.as_ref(), &key).await?;
            if let Some(version) = self
                .local
                .rollback_if_regressed(self.store.as_ref(), &key, &metrics)
                .await?
            {
                receipt.rolled_back.push((key.task, version));
            }
        }

        if self.config.auto_retrain {
            self.schedule_retraining(&result.user_id).await;
        }
        Ok(receipt)
    }

    /// Tier, metrics and progress for one user and task.
    pub async fn graduation_status(&self, user_id: &str, task: TaskType) -> Result<GraduationStatus> {
        let key = ModelKey::new(user_id, task);
        let mut notices = Vec::new();
        let model = self.load_model(&key, &mut notices).await?;
        let example_count = self
            .store
            .count_examples(&key, &self.config.training_window)
            .await?;
        let metrics = self.feedback.metrics(self.store.as_ref(), &key).await?.summary();
        let tier = self.policy.tier(example_count, &metrics, model.is_some());

        Ok(GraduationStatus {
            user_id: user_id.to_string(),
            task,
            tier,
            behavior: tier.behavior(),
            metrics,
            example_count,
            examples_needed_for_next_tier: self.policy.examples_needed_for_next_tier(tier, example_count),
            model_version: model.map(|m| m.version),
        })
    }

    /// Train and commit a new snapshot now, waiting for any running
    /// training on the same key.
    pub async fn retrain_now(&self, user_id: &str, task: TaskType) -> Result<TrainedSnapshot> {
        let key = ModelKey::new(user_id, task);
        let _guard = self.training_locks.lock(&key).await;
        self.local.train(self.store.as_ref(), &key).await
    }

    /// Drop cached models unused for `max_idle`. Returns the count.
    pub fn evict_idle_models(&self, max_idle: Duration) -> usize {
        let evicted = self.local.registry().evict_idle(max_idle);
        if evicted > 0 {
            debug!(evicted, "Evicted idle local models");
        }
        evicted
    }

    /// Wait for background training started so far.
    pub async fn wait_for_training(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.training_tasks.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Training task panicked");
            }
        }
    }

    async fn analyze(
        &self,
        user_id: &str,
        candidates: &[Candidate<'_>],
        indices: &[usize],
        cancel: &CancellationToken,
        outcome: &mut ScanOutcome,
    ) -> (HashMap<usize, std::result::Result<LlmVerdict, AnalyzerError>>, HashSet<usize>) {
        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<(Vec<usize>, LlmBatch)> = indices
            .chunks(batch_size)
            .map(|chunk| {
                let batch = chunk.iter().fold(LlmBatch::new(user_id), |batch, &i| {
                    let candidate = &candidates[i];
                    match &candidate.sanitized {
                        Ok(text) => batch.with_item(BatchItem {
                            id: candidate.message.id.clone(),
                            sender_domain: candidate.message.sender_domain.clone(),
                            text: text.clone(),
                        }),
                        Err(_) => batch,
                    }
                });
                (chunk.to_vec(), batch)
            })
            .collect();

        let analyzer = &self.analyzer;
        let completed: Vec<(Vec<usize>, Option<_>)> = stream::iter(batches)
            .map(|(chunk, batch)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return (chunk, None);
                    }
                    let verdicts = analyzer.analyze_batch(&batch).await;
                    (chunk, Some(verdicts))
                }
            })
            .buffer_unordered(self.config.llm_max_concurrency.max(1))
            .collect()
            .await;

        let mut verdicts = HashMap::new();
        let mut skipped = HashSet::new();
        for (chunk, batch_verdicts) in completed {
            let Some(mut batch_verdicts) = batch_verdicts else {
                skipped.extend(chunk);
                continue;
            };
            outcome.stats.llm_batches += 1;
            for i in chunk {
                let id = &candidates[i].message.id;
                let verdict = batch_verdicts
                    .remove(id)
                    .unwrap_or_else(|| Err(AnalyzerError::Malformed(format!("no verdict for {id}"))));
                match &verdict {
                    Ok(_) => outcome.stats.llm_items += 1,
                    Err(AnalyzerError::BudgetExceeded { period }) => {
                        self.push_budget_notice(user_id, period, &mut outcome.notices);
                    }
                    Err(_) => {}
                }
                verdicts.insert(i, verdict);
            }
        }
        if !skipped.is_empty() {
            info!(user_id, skipped = skipped.len(), "Pass cancelled before all LLM batches were issued");
        }
        (verdicts, skipped)
    }

    fn decide(
        &self,
        user_id: &str,
        tier: Tier,
        type_cutoff: Option<f32>,
        candidate: &Candidate<'_>,
        route: &Route,
        verdict: Option<&LlmVerdict>,
    ) -> ClassificationResult {
        let pattern = &candidate.pattern;
        let pattern_vote = EngineVote::new(pattern.is_transaction(), pattern.vote_confidence());
        let local_vote = candidate
            .local
            .as_ref()
            .map(|p| EngineVote::new(p.class == TRANSACTION_CLASS, p.confidence));
        let local_label = candidate.local_is_transaction();

        let (input, engine, model_version, fallback) = match (route, verdict) {
            (Route::Local, _) => (
                AggregateInput {
                    authority: Authority::Local,
                    pattern: pattern_vote,
                    llm: None,
                    local: local_vote,
                },
                Engine::Local,
                candidate.local.as_ref().map(|p| format!("local:v{}", p.version)),
                None,
            ),
            (Route::Llm, Some(v)) => {
                let llm_vote = EngineVote::new(v.is_transaction, v.confidence);
                let agrees = local_label == Some(v.is_transaction);
                let local = match tier {
                    Tier::Learning | Tier::Validating => None,
                    Tier::Assisting => local_vote.filter(|_| agrees),
                    Tier::Primary | Tier::Graduated => local_vote,
                };
                let engine = if local.is_some() && agrees {
                    Engine::Hybrid
                } else {
                    Engine::Llm
                };
                (
                    AggregateInput {
                        authority: Authority::Llm,
                        pattern: pattern_vote,
                        llm: Some(llm_vote),
                        local,
                    },
                    engine,
                    Some(self.analyzer.model_id().to_string()),
                    None,
                )
            }
            (Route::Fallback(reason), _) => (
                AggregateInput {
                    authority: Authority::Pattern,
                    pattern: pattern_vote,
                    llm: None,
                    local: None,
                },
                Engine::Pattern,
                None,
                Some(reason.to_string()),
            ),
            (Route::Llm, None) => (
                AggregateInput {
                    authority: Authority::Pattern,
                    pattern: pattern_vote,
                    llm: None,
                    local: None,
                },
                Engine::Pattern,
                None,
                Some("unavailable".to_string()),
            ),
        };
        let aggregate = self.aggregator.aggregate(&input);

        let local_type = candidate
            .local_type
            .as_ref()
            .and_then(|p| TransactionType::parse(&p.class).map(|t| (t, p.confidence)));
        let transaction_type = if !aggregate.is_transaction {
            None
        } else {
            match engine {
                Engine::Llm | Engine::Hybrid => verdict
                    .and_then(|v| v.transaction_type)
                    .or(pattern.transaction_type),
                Engine::Local => local_type
                    .filter(|(_, confidence)| type_cutoff.is_some_and(|cut| *confidence >= cut))
                    .map(|(t, _)| t)
                    .or(pattern.transaction_type),
                _ => pattern.transaction_type,
            }
        };

        ClassificationResult {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            message_id: candidate.message.id.clone(),
            thread_key: ThreadKey::for_message(candidate.message),
            sent_at: candidate.message.sent_at,
            is_transaction: aggregate.is_transaction,
            confidence: aggregate.confidence,
            level: aggregate.level,
            source_scores: SourceScores {
                pattern: Some(pattern.score),
                llm: input.llm.map(|v| v.p_transaction()),
                local: input
                    .local
                    .and(candidate.local.as_ref())
                    .and_then(|p| p.positive_probability),
            },
            engine_used: engine,
            model_version,
            fallback_used: fallback.is_some(),
            tier,
            origin: ResultOrigin::Direct,
            transaction_type,
            entities: verdict
                .filter(|_| aggregate.is_transaction)
                .and_then(|v| v.entities.clone()),
            matched_signals: pattern.matched_signals.clone(),
            features_ref: Some(features_ref(&candidate.features)),
            diagnostics: ResultDiagnostics {
                local_is_transaction: local_label,
                local_transaction_type: local_type.map(|(t, _)| t),
                local_versions: (
                    candidate.local.as_ref().map(|p| p.version),
                    candidate.local_type.as_ref().map(|p| p.version),
                ),
                llm_is_transaction: verdict.map(|v| v.is_transaction),
                llm_confidence: verdict.map(|v| v.confidence),
                llm_transaction_type: verdict.and_then(|v| v.transaction_type),
                pattern_is_transaction: pattern.is_transaction(),
                analyzer_failure: fallback,
            },
            supersedes: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn push_budget_notice(&self, user_id: &str, period: &str, notices: &mut Vec<ScanNotice>) {
        if self.analyzer.first_budget_notice(user_id, period) {
            warn!(user_id, period, "LLM budget exhausted, continuing pattern-only");
            notices.push(ScanNotice::BudgetExceeded {
                user_id: user_id.to_string(),
                period: period.to_string(),
            });
        }
    }

    /// Tier and model for a task. Storage failures degrade to tier 1.
    async fn task_state(&self, key: &ModelKey, notices: &mut Vec<ScanNotice>) -> TaskState {
        match self.try_task_state(key, notices).await {
            Ok(state) => state,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not compute tier, using tier 1");
                TaskState {
                    tier: Tier::Learning,
                    model: None,
                }
            }
        }
    }

    async fn try_task_state(&self, key: &ModelKey, notices: &mut Vec<ScanNotice>) -> Result<TaskState> {
        let model = self.load_model(key, notices).await?;
        let example_count = self
            .store
            .count_examples(key, &self.config.training_window)
            .await?;
        let metrics = self.feedback.metrics(self.store.as_ref(), key).await?.summary();
        let tier = self.policy.tier(example_count, &metrics, model.is_some());
        debug!(key = %key, tier = %tier, example_count, evaluated = metrics.evaluated, "Computed tier");
        Ok(TaskState { tier, model })
    }

    /// Load the current model, discarding it and resetting metrics when the
    /// snapshot is corrupt.
    async fn load_model(
        &self,
        key: &ModelKey,
        notices: &mut Vec<ScanNotice>,
    ) -> Result<Option<Arc<ModelSnapshot>>> {
        match self.local.load(self.store.as_ref(), key).await {
            Err(ClassifierError::ModelCorruption {
                key,
                version,
                reason,
            }) => {
                warn!(key = %key, version, reason = %reason, "Discarding corrupt model snapshot");
                self.local.discard(self.store.as_ref(), &key, version).await?;
                self.feedback.reset_metrics(self.store.as_ref(), &key).await?;
                notices.push(ScanNotice::ModelReset {
                    key,
                    version,
                    reason,
                });
                Ok(None)
            }
            other => other,
        }
    }

    /// Latest stored results of a thread. Singletons have no siblings to join.
    async fn stored_thread(&self, user_id: &str, key: &ThreadKey) -> Vec<ClassificationResult> {
        if key.is_singleton() {
            return Vec::new();
        }
        match self.store.results_for_thread(user_id, key).await {
            Ok(results) => results,
            Err(e) => {
                warn!(user_id, thread = %key, error = %e, "Could not load stored thread results");
                Vec::new()
            }
        }
    }

    /// Feature text kept for training. Falls back to the unredacted text when
    /// sanitizing fails; that text is only used in-process.
    fn feature_text(&self, message: &Message) -> String {
        let max_chars = self.config.max_chars_per_message;
        match self.sanitizer.sanitize_message(message, max_chars) {
            Ok(text) => text.into_inner(),
            Err(_) => truncate(compose(message), max_chars),
        }
    }

    fn propagated_write(&self, representative: &ClassificationResult, message: &Message) -> PendingWrite {
        let features = self.feature_text(message);
        let mut result = representative.propagate_to(&message.id, message.sent_at);
        result.features_ref = Some(features_ref(&features));
        PendingWrite {
            result,
            features: Some(features),
        }
    }

    async fn persist_once(&self, write: &PendingWrite) -> Result<()> {
        if let (Some(text), Some(reference)) = (&write.features, &write.result.features_ref) {
            self.store
                .put_features(&write.result.user_id, reference, text)
                .await?;
        }
        self.store.save_result(&write.result).await
    }

    async fn persist_with_retry(&self, write: &PendingWrite) -> bool {
        let attempts = self.config.persist_max_attempts.max(1);
        for attempt in 0..attempts {
            match self.persist_once(write).await {
                Ok(()) => return true,
                Err(e) => {
                    warn!(
                        result_id = %write.result.id,
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to persist result"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.config.persist_backoff() * 2u32.saturating_pow(attempt)).await;
                    }
                }
            }
        }
        false
    }

    /// Retry results held over from earlier passes. Returns how many were
    /// written.
    async fn flush_uncommitted(&self) -> usize {
        let pending = std::mem::take(&mut *self.uncommitted.lock().unwrap());
        if pending.is_empty() {
            return 0;
        }
        let mut flushed = 0;
        let mut still_failing = Vec::new();
        for write in pending {
            if self.persist_with_retry(&write).await {
                flushed += 1;
            } else {
                still_failing.push(write);
            }
        }
        if !still_failing.is_empty() {
            self.uncommitted.lock().unwrap().extend(still_failing);
        }
        info!(flushed, "Flushed uncommitted results");
        flushed
    }

    /// Start background training for every task with enough new examples.
    async fn schedule_retraining(&self, user_id: &str) {
        for task in TaskType::ALL {
            let key = ModelKey::new(user_id, task);
            match self
                .local
                .needs_retrain(self.store.as_ref(), &key, self.config.retrain_example_threshold)
                .await
            {
                Ok(true) => self.spawn_training(key),
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Retrain check failed"),
            }
        }
    }

    fn spawn_training(&self, key: ModelKey) {
        // At most one training run per key; later triggers are dropped.
        let Some(guard) = self.training_locks.try_lock(&key) else {
            debug!(key = %key, "Training already running");
            return;
        };
        let store = self.store.clone();
        let local = self.local.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            match local.train(store.as_ref(), &key).await {
                Ok(trained) => debug!(key = %key, version = trained.version, "Background training done"),
                Err(ClassifierError::Training(
                    e @ (TrainingError::InsufficientExamples { .. } | TrainingError::SingleClass { .. }),
                )) => debug!(key = %key, reason = %e, "Skipped training"),
                Err(e) => warn!(key = %key, error = %e, "Background training failed"),
            }
        });
        let mut tasks = self.training_tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }
}

/// Earliest directly classified message among a thread's stored results.
fn stored_representative(stored: &[ClassificationResult]) -> Option<&ClassificationResult> {
    stored
        .iter()
        .filter(|r| matches!(r.origin, ResultOrigin::Direct))
        .min_by(|a, b| (a.sent_at, &a.message_id).cmp(&(b.sent_at, &b.message_id)))
}

/// True when a stored result's message was sent before `message`.
fn precedes(stored: &ClassificationResult, message: &Message) -> bool {
    (stored.sent_at, stored.message_id.as_str()) < (message.sent_at, message.id.as_str())
}
