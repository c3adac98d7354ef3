//! Batched LLM analysis with budget, rate, concurrency and retry guards.
//!
//! Every call goes through, in order:
//! 1. budget reservation against the usage ledger (hard cap, no call when
//!    the reservation is refused)
//! 2. the user's concurrency permit
//! 3. the user's rate limiter
//! 4. a per-call timeout, retried with exponential backoff on transient
//!    failures
//!
//! Failures are returned per item; the caller falls back to the pattern
//! engine for those items.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{AnalyzerError, AnalyzerResult};
use crate::pipeline::prompts::parse_response;
use crate::traits::budget::{budget_period, BudgetCap, UsageLedger};
use crate::traits::llm::{LlmBackend, LlmBatch, LlmCompletion};
use crate::types::config::ClassifierConfig;
use crate::types::result::TransactionEntities;
use crate::types::training::TransactionType;

/// Parsed LLM verdict for one message.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmVerdict {
    pub is_transaction: bool,
    pub confidence: f32,
    pub transaction_type: Option<TransactionType>,
    pub entities: Option<TransactionEntities>,
}

/// Per-message analysis outcome, keyed by message id.
pub type BatchVerdicts = HashMap<String, AnalyzerResult<LlmVerdict>>;

/// Limits applied to every call.
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub requests_per_minute: u32,
    pub max_concurrency: usize,
    pub budget_cap: BudgetCap,
}

impl AnalyzerSettings {
    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            timeout: config.llm_timeout(),
            max_retries: config.llm_max_retries,
            backoff_base: config.llm_backoff_base(),
            requests_per_minute: config.llm_requests_per_minute,
            max_concurrency: config.llm_max_concurrency,
            budget_cap: config.budget_cap(),
        }
    }
}

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalyzerStats {
    /// Provider requests, including retries
    pub requests_issued: u64,
    /// Items that received a parsed verdict
    pub items_analyzed: u64,
}

/// Cloud LLM analyzer.
pub struct LlmAnalyzer<B: LlmBackend> {
    backend: Arc<B>,
    ledger: Arc<dyn UsageLedger>,
    settings: AnalyzerSettings,
    limiter: DefaultKeyedRateLimiter<String>,
    permits: Mutex<HashMap<String, Arc<Semaphore>>>,
    budget_notices: Mutex<HashSet<(String, String)>>,
    requests_issued: AtomicU64,
    items_analyzed: AtomicU64,
}

impl<B: LlmBackend> LlmAnalyzer<B> {
    pub fn new(backend: Arc<B>, ledger: Arc<dyn UsageLedger>, settings: AnalyzerSettings) -> Self {
        let rpm = NonZeroU32::new(settings.requests_per_minute).unwrap_or(nonzero!(60u32));
        Self {
            backend,
            ledger,
            limiter: RateLimiter::keyed(Quota::per_minute(rpm)),
            settings,
            permits: Mutex::new(HashMap::new()),
            budget_notices: Mutex::new(HashSet::new()),
            requests_issued: AtomicU64::new(0),
            items_analyzed: AtomicU64::new(0),
        }
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }

    pub fn stats(&self) -> AnalyzerStats {
        AnalyzerStats {
            requests_issued: self.requests_issued.load(Ordering::Relaxed),
            items_analyzed: self.items_analyzed.load(Ordering::Relaxed),
        }
    }

    /// Whether the user's budget for the current period is spent.
    pub async fn budget_exhausted(&self, user_id: &str) -> AnalyzerResult<bool> {
        if self.settings.budget_cap.is_unlimited() {
            return Ok(false);
        }
        let period = budget_period(Utc::now());
        let usage = self
            .ledger
            .usage(user_id, &period)
            .await
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?;
        Ok(self.settings.budget_cap.is_exhausted(&usage))
    }

    /// True the first time it is called for a user and period.
    pub fn first_budget_notice(&self, user_id: &str, period: &str) -> bool {
        self.budget_notices
            .lock()
            .unwrap()
            .insert((user_id.to_string(), period.to_string()))
    }

    fn permits_for(&self, user_id: &str) -> Arc<Semaphore> {
        self.permits
            .lock()
            .unwrap()
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.settings.max_concurrency.max(1))))
            .clone()
    }

    /// Analyze one batch. Every item in the batch gets an entry.
    pub async fn analyze_batch(&self, batch: &LlmBatch) -> BatchVerdicts {
        match self.run(batch).await {
            Ok(verdicts) => verdicts,
            Err(err) => batch
                .items
                .iter()
                .map(|item| (item.id.clone(), Err(err.clone())))
                .collect(),
        }
    }

    async fn run(&self, batch: &LlmBatch) -> AnalyzerResult<BatchVerdicts> {
        if batch.is_empty() {
            return Ok(HashMap::new());
        }
        let user_id = batch.user_id.as_str();
        let period = budget_period(Utc::now());
        let estimate = batch.estimated_tokens();

        let reservation = self
            .ledger
            .try_reserve(user_id, &period, estimate, &self.settings.budget_cap)
            .await
            .map_err(|e| AnalyzerError::Unavailable(e.to_string()))?
            .ok_or_else(|| AnalyzerError::BudgetExceeded {
                period: period.clone(),
            })?;

        let semaphore = self.permits_for(user_id);
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|_| AnalyzerError::Unavailable("concurrency limiter closed".into()))?;

        let result = self.complete_with_retry(batch).await;

        let spent = match &result {
            Ok(completion) => completion.usage.map(|u| u.total()).unwrap_or(estimate),
            // The provider may have billed a call that timed out.
            Err(AnalyzerError::Timeout { .. }) => estimate,
            Err(_) => 0,
        };
        if let Err(e) = self.ledger.settle(reservation, spent).await {
            warn!(user_id, error = %e, "Failed to settle LLM usage");
        }

        let completion = result?;
        let response = parse_response(&completion.content)?;

        let mut by_id: HashMap<String, LlmVerdict> = response
            .results
            .into_iter()
            .map(|v| {
                let verdict = LlmVerdict {
                    is_transaction: v.is_transaction,
                    confidence: v.confidence,
                    transaction_type: v.transaction_type.as_deref().and_then(TransactionType::parse),
                    entities: v.entities.filter(|e| !e.is_empty()),
                };
                (v.id, verdict)
            })
            .collect();

        let verdicts: BatchVerdicts = batch
            .items
            .iter()
            .map(|item| {
                let verdict = by_id.remove(&item.id).ok_or_else(|| {
                    AnalyzerError::Malformed(format!("no verdict for message {}", item.id))
                });
                (item.id.clone(), verdict)
            })
            .collect();

        let analyzed = verdicts.values().filter(|v| v.is_ok()).count() as u64;
        self.items_analyzed.fetch_add(analyzed, Ordering::Relaxed);
        debug!(
            user_id,
            items = batch.len(),
            analyzed,
            tokens = spent,
            "LLM batch analyzed"
        );
        Ok(verdicts)
    }

    async fn complete_with_retry(&self, batch: &LlmBatch) -> AnalyzerResult<LlmCompletion> {
        let mut attempt = 0u32;
        loop {
            self.limiter.until_key_ready(&batch.user_id).await;
            self.requests_issued.fetch_add(1, Ordering::Relaxed);

            let result = match tokio::time::timeout(self.settings.timeout, self.backend.complete(batch)).await {
                Ok(result) => result,
                Err(_) => Err(AnalyzerError::Timeout {
                    after_ms: self.settings.timeout.as_millis() as u64,
                }),
            };

            match result {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_transient() && attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff_base * 2u32.saturating_pow(attempt);
                    info!(
                        user_id = %batch.user_id,
                        attempt = attempt + 1,
                        error = err.kind(),
                        delay_ms = delay.as_millis() as u64,
                        "Retrying LLM batch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(
                        user_id = %batch.user_id,
                        attempts = attempt + 1,
                        error = %err,
                        "LLM batch failed"
                    );
                    return Err(err);
                }
            }
        }
    }
}
