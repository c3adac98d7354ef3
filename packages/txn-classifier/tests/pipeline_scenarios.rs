//! End-to-end tests for the classification pass.
//!
//! Each test wires an `Orchestrator` to in-memory stores and the mock LLM
//! and checks one routing, degradation or bookkeeping behavior.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use txn_classifier::local::Vocabulary;
use txn_classifier::testing::fixtures::{mixed_inbox, newsletter_message, thread, transaction_message};
use txn_classifier::{
    budget_period, AnalyzerError, ClassifierConfig, Engine, FeedbackAction, FlakyStore,
    LabelSource, MemoryStore, MemoryUsageLedger, Message, MetricsStore, MetricsWindow, MockLlm,
    ModelKey, ModelMetrics, ModelSnapshot, Orchestrator, Outcome, ResultOrigin, ResultStore,
    ScanNotice, SnapshotStore, TaskType, Tier, TrainingExample, TrainingStore, TransactionType,
};

const USER: &str = "agent-7";

fn config() -> ClassifierConfig {
    ClassifierConfig::new()
        .with_auto_retrain(false)
        .with_persist_retries(3, Duration::from_millis(1))
        .with_llm_retries(0, Duration::from_millis(1))
}

fn orchestrator_with(
    store: Arc<MemoryStore>,
    llm: Arc<MockLlm>,
    config: ClassifierConfig,
) -> Orchestrator<MemoryStore, MockLlm> {
    Orchestrator::new(store, llm, Arc::new(MemoryUsageLedger::new()), config).unwrap()
}

fn setup(llm: MockLlm) -> (Orchestrator<MemoryStore, MockLlm>, Arc<MemoryStore>, Arc<MockLlm>) {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(llm);
    (orchestrator_with(store.clone(), llm.clone(), config()), store, llm)
}

/// Detection model scoring `sigmoid(weight + bias)` on any text that
/// mentions escrow and `sigmoid(bias)` on the rest.
fn detection_model(version: i64, weight: f32, bias: f32) -> ModelSnapshot {
    ModelSnapshot {
        key: ModelKey::detection(USER),
        version,
        classes: TaskType::TransactionDetection.classes(),
        vocabulary: Vocabulary::from_terms([("escrow".to_string(), 1.0)]),
        weights: vec![weight],
        bias: vec![bias],
        trained_at: Utc::now(),
        training_example_count: 400,
    }
}

/// Detection model that scores "escrow" strongly positive.
fn escrow_model(version: i64) -> ModelSnapshot {
    detection_model(version, 8.0, -2.0)
}

/// 0.75 transaction on escrow text, 0.71 not-transaction elsewhere.
fn lukewarm_model() -> ModelSnapshot {
    detection_model(1, 2.0, -0.9014)
}

/// Detection metrics with the given confusion counts, attributed to `version`.
fn detection_metrics(tp: usize, tn: usize, fp: usize, fn_: usize, version: i64) -> ModelMetrics {
    let mut metrics = ModelMetrics::new(TaskType::TransactionDetection, MetricsWindow::default());
    let rows = [
        (tp, "transaction", "transaction"),
        (tn, "not_transaction", "not_transaction"),
        (fp, "transaction", "not_transaction"),
        (fn_, "not_transaction", "transaction"),
    ];
    for (count, predicted, actual) in rows {
        for _ in 0..count {
            metrics.record(Outcome {
                result_id: Uuid::now_v7(),
                predicted: predicted.to_string(),
                actual: actual.to_string(),
                model_version: Some(version),
                source: LabelSource::User,
                recorded_at: Utc::now(),
            });
        }
    }
    metrics
}

/// Commit `model`, add `examples` user examples split between the two
/// classes, and store `metrics` when given.
async fn seed_tier(
    store: &MemoryStore,
    model: ModelSnapshot,
    examples: usize,
    metrics: Option<ModelMetrics>,
) {
    store.commit_snapshot(model.to_record().unwrap()).await.unwrap();
    let key = ModelKey::detection(USER);
    for i in 0..examples {
        let (text, label) = if i % 2 == 0 {
            ("escrow opens monday", "transaction")
        } else {
            ("weekly market report", "not_transaction")
        };
        store
            .append_example(&TrainingExample::new(key.clone(), text, label, LabelSource::User))
            .await
            .unwrap();
    }
    if let Some(metrics) = metrics {
        store.save_metrics(&key, &metrics).await.unwrap();
    }
}

/// Put a user at tier 4: committed model, 400 examples, 0.94 accuracy.
async fn seed_primary_tier(store: &MemoryStore) {
    seed_tier(store, escrow_model(1), 400, Some(detection_metrics(50, 44, 3, 3, 1))).await;
}

#[tokio::test]
async fn test_independent_threads_at_tier_one_all_go_to_llm() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    let inbox = mixed_inbox(600);

    let outcome = orchestrator.classify(USER, &inbox).await.unwrap();

    assert_eq!(outcome.results.len(), 600);
    assert_eq!(llm.items_seen(), 600);
    assert_eq!(llm.call_count(), 30);
    assert_eq!(outcome.stats.llm_items, 600);
    assert_eq!(outcome.stats.propagated, 0);
    assert!(outcome.results.iter().all(|r| r.tier == Tier::Learning));
    assert!(outcome.results.iter().all(|r| r.engine_used == Engine::Llm));
    assert!(outcome.results.iter().all(|r| r.source_scores.local.is_none()));
    assert_eq!(store.result_count(), 600);

    // Results come back in input order.
    let ids: Vec<&str> = outcome.results.iter().map(|r| r.message_id.as_str()).collect();
    let expected: Vec<&str> = inbox.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, expected);

    assert!(outcome.result_for("m0000").unwrap().is_transaction);
    assert!(!outcome.result_for("m0001").unwrap().is_transaction);
}

#[tokio::test]
async fn test_thread_is_analyzed_once_and_propagated() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    let messages = thread("t-1", 50);

    let outcome = orchestrator.classify(USER, &messages).await.unwrap();

    assert_eq!(llm.call_count(), 1);
    assert_eq!(llm.items_seen(), 1);
    assert_eq!(llm.calls()[0].item_ids, vec!["t-1-000".to_string()]);
    assert_eq!(outcome.results.len(), 50);
    assert_eq!(outcome.stats.propagated, 49);

    let representative = outcome.result_for("t-1-000").unwrap();
    assert!(!representative.is_propagated());
    for result in outcome.results.iter().skip(1) {
        assert!(result.is_propagated());
        assert!(result.same_decision(representative));
        assert_eq!(result.thread_key, representative.thread_key);
        assert!(result.features_ref.is_some());
    }
    assert_eq!(store.result_count(), 50);
}

#[tokio::test]
async fn test_feedback_on_propagated_sibling() {
    let (orchestrator, store, _llm) = setup(MockLlm::new());
    let outcome = orchestrator.classify(USER, &thread("t-2", 3)).await.unwrap();
    let sibling = outcome.result_for("t-2-002").unwrap();
    let before = store.example_count(&ModelKey::detection(USER));

    let receipt = orchestrator
        .record_feedback(sibling.id, FeedbackAction::Dismiss)
        .await
        .unwrap();

    assert_eq!(receipt.examples_added, 1);
    assert_eq!(store.example_count(&ModelKey::detection(USER)), before + 1);
}

#[tokio::test]
async fn test_late_reply_joins_thread_from_earlier_pass() {
    let (orchestrator, store, llm) = setup(MockLlm::new().with_verdict("t-3-002", false, 0.95));
    let messages = thread("t-3", 3);

    let first = orchestrator.classify(USER, &messages[..2]).await.unwrap();
    let representative = first.result_for("t-3-000").unwrap().clone();
    assert!(representative.is_transaction);

    let second = orchestrator.classify(USER, &messages[2..]).await.unwrap();

    // The reply is never analyzed; it carries the stored decision.
    assert_eq!(llm.call_count(), 1);
    assert_eq!(second.stats.llm_items, 0);
    assert_eq!(second.stats.propagated, 1);
    let late = second.result_for("t-3-002").unwrap();
    assert!(late.same_decision(&representative));
    assert_eq!(
        late.origin,
        ResultOrigin::Propagated {
            representative_message_id: "t-3-000".to_string(),
            representative_result_id: representative.id,
        }
    );
    assert!(late.features_ref.is_some());
    assert_eq!(
        store.latest_result(USER, "t-3-002").await.unwrap().map(|r| r.id),
        Some(late.id)
    );
}

#[tokio::test]
async fn test_earlier_message_takes_over_stored_thread() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    let messages = thread("t-4", 4);

    orchestrator.classify(USER, &messages[1..]).await.unwrap();
    let independent = orchestrator.reclassify(USER, &messages[3]).await.unwrap();
    assert_eq!(llm.call_count(), 2);

    let outcome = orchestrator.classify(USER, &messages[..1]).await.unwrap();

    assert_eq!(llm.call_count(), 3);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.stats.repropagated, 2);
    let representative = outcome.result_for("t-4-000").unwrap();
    assert!(!representative.is_propagated());

    for id in ["t-4-001", "t-4-002"] {
        let latest = store.latest_result(USER, id).await.unwrap().unwrap();
        assert!(latest.same_decision(representative));
        assert!(matches!(
            &latest.origin,
            ResultOrigin::Propagated { representative_result_id, .. }
                if *representative_result_id == representative.id
        ));
        assert!(latest.supersedes.is_some());
        assert!(latest.features_ref.is_some());
    }
    // Classified on its own, so it keeps its own result.
    let kept = store.latest_result(USER, "t-4-003").await.unwrap().unwrap();
    assert_eq!(kept.id, independent.id);
}

#[tokio::test]
async fn test_confident_local_model_skips_llm_at_tier_four() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    seed_primary_tier(&store).await;

    let status = orchestrator
        .graduation_status(USER, TaskType::TransactionDetection)
        .await
        .unwrap();
    assert_eq!(status.tier, Tier::Primary);
    assert_eq!(status.model_version, Some(1));

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();

    let result = &outcome.results[0];
    assert_eq!(result.engine_used, Engine::Local);
    assert_eq!(result.tier, Tier::Primary);
    assert!(result.is_transaction);
    assert!(result.confidence >= 0.80);
    assert_eq!(result.model_version.as_deref(), Some("local:v1"));
    assert_eq!(llm.call_count(), 0);
    assert_eq!(outcome.stats.local_decisions, 1);
}

#[tokio::test]
async fn test_tier_two_runs_local_silently() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    seed_tier(&store, escrow_model(1), 100, None).await;

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();

    let result = &outcome.results[0];
    assert_eq!(result.tier, Tier::Validating);
    assert_eq!(result.engine_used, Engine::Llm);
    assert_eq!(result.source_scores.local, None);
    assert_eq!(result.diagnostics.local_is_transaction, Some(true));
    assert_eq!(result.diagnostics.local_versions.0, Some(1));
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_tier_three_hides_disagreeing_local() {
    let (orchestrator, store, llm) = setup(MockLlm::new().with_verdict("m-1", true, 0.92));
    seed_tier(&store, escrow_model(1), 400, Some(detection_metrics(45, 35, 10, 10, 1))).await;

    let outcome = orchestrator
        .classify(USER, &[newsletter_message("m-1")])
        .await
        .unwrap();

    let result = &outcome.results[0];
    assert_eq!(result.tier, Tier::Assisting);
    assert_eq!(result.engine_used, Engine::Llm);
    assert_eq!(result.source_scores.local, None);
    assert_eq!(result.diagnostics.local_is_transaction, Some(false));
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_tier_four_below_threshold_uses_local_as_secondary() {
    let (orchestrator, store, llm) = setup(MockLlm::new().with_verdict("m-2", true, 0.92));
    seed_tier(&store, lukewarm_model(), 400, Some(detection_metrics(50, 44, 3, 3, 1))).await;

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1"), newsletter_message("m-2")])
        .await
        .unwrap();

    // 0.75 is under the 0.80 threshold, so both go to the LLM.
    assert_eq!(llm.call_count(), 1);
    assert_eq!(llm.items_seen(), 2);
    assert_eq!(outcome.stats.local_decisions, 0);

    let agreeing = outcome.result_for("m-1").unwrap();
    assert_eq!(agreeing.tier, Tier::Primary);
    assert_eq!(agreeing.engine_used, Engine::Hybrid);
    assert!((agreeing.source_scores.local.unwrap() - 0.75).abs() < 1e-3);

    let disagreeing = outcome.result_for("m-2").unwrap();
    assert_eq!(disagreeing.engine_used, Engine::Llm);
    assert!(disagreeing.source_scores.local.unwrap() < 0.5);
    assert_eq!(disagreeing.diagnostics.llm_is_transaction, Some(true));
}

#[tokio::test]
async fn test_tier_five_trusts_local_down_to_ninety_percent_of_threshold() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    seed_tier(&store, lukewarm_model(), 1000, Some(detection_metrics(60, 38, 1, 1, 1))).await;

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1"), newsletter_message("m-2")])
        .await
        .unwrap();

    // 0.75 clears the 0.72 cutoff; 0.71 does not.
    let local = outcome.result_for("m-1").unwrap();
    assert_eq!(local.tier, Tier::Graduated);
    assert_eq!(local.engine_used, Engine::Local);
    assert_eq!(local.model_version.as_deref(), Some("local:v1"));

    assert_eq!(llm.call_count(), 1);
    assert_eq!(llm.calls()[0].item_ids, vec!["m-2".to_string()]);
    let escalated = outcome.result_for("m-2").unwrap();
    assert_eq!(escalated.engine_used, Engine::Hybrid);
    assert!(escalated.source_scores.local.is_some());
    assert!(!escalated.is_transaction);
}

#[tokio::test]
async fn test_llm_timeout_falls_back_to_patterns() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(MockLlm::new().with_delay(Duration::from_millis(200)));
    let orchestrator = orchestrator_with(
        store.clone(),
        llm.clone(),
        config().with_llm_timeout(Duration::from_millis(20)),
    );

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1"), newsletter_message("m-2")])
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 2);
    for result in &outcome.results {
        assert!(result.fallback_used);
        assert_eq!(result.engine_used, Engine::Pattern);
        assert_eq!(result.diagnostics.analyzer_failure.as_deref(), Some("timeout"));
        assert!((0.0..=1.0).contains(&result.confidence));
    }
    assert!(outcome.result_for("m-1").unwrap().is_transaction);
    assert!(!outcome.result_for("m-2").unwrap().is_transaction);
    assert_eq!(outcome.stats.fallbacks, 2);
    assert_eq!(store.result_count(), 2);
}

#[tokio::test]
async fn test_invalid_credential_falls_back_without_retry() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(MockLlm::new().failing(AnalyzerError::InvalidCredential));
    let orchestrator = orchestrator_with(
        store,
        llm.clone(),
        config().with_llm_retries(3, Duration::from_millis(1)),
    );

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 1);
    assert_eq!(
        outcome.results[0].diagnostics.analyzer_failure.as_deref(),
        Some("invalid_credential")
    );
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(MockLlm::new().failing_times(1, AnalyzerError::RateLimited));
    let orchestrator = orchestrator_with(
        store,
        llm.clone(),
        config().with_llm_retries(2, Duration::from_millis(1)),
    );

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 2);
    assert_eq!(outcome.results[0].engine_used, Engine::Llm);
    assert!(!outcome.results[0].fallback_used);
}

#[tokio::test]
async fn test_missing_verdict_falls_back_for_that_message_only() {
    let (orchestrator, _store, _llm) = setup(MockLlm::new().omitting("m-2"));

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1"), transaction_message("m-2")])
        .await
        .unwrap();

    assert_eq!(outcome.result_for("m-1").unwrap().engine_used, Engine::Llm);
    let missing = outcome.result_for("m-2").unwrap();
    assert!(missing.fallback_used);
    assert_eq!(missing.diagnostics.analyzer_failure.as_deref(), Some("malformed"));
}

#[tokio::test]
async fn test_accuracy_drop_demotes_to_tier_three() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    seed_primary_tier(&store).await;
    let key = ModelKey::detection(USER);

    let first = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();
    assert_eq!(first.results[0].tier, Tier::Primary);

    store
        .save_metrics(&key, &detection_metrics(45, 35, 10, 10, 1))
        .await
        .unwrap();

    let status = orchestrator
        .graduation_status(USER, TaskType::TransactionDetection)
        .await
        .unwrap();
    assert_eq!(status.tier, Tier::Assisting);
    assert!((status.metrics.accuracy - 0.80).abs() < 1e-6);

    let second = orchestrator
        .classify(USER, &[transaction_message("m-2")])
        .await
        .unwrap();
    let result = &second.results[0];
    assert_eq!(result.tier, Tier::Assisting);
    // Local agrees with the LLM, so it is surfaced alongside it.
    assert_eq!(result.engine_used, Engine::Hybrid);
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_exhausted_budget_means_zero_llm_calls() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(MockLlm::new());
    let ledger = Arc::new(MemoryUsageLedger::new());
    ledger.record(USER, &budget_period(Utc::now()), 1_000);
    let orchestrator = Orchestrator::new(
        store,
        llm.clone(),
        ledger.clone(),
        config().with_budget_cap_tokens(1_000),
    )
    .unwrap();

    let first = orchestrator.classify(USER, &mixed_inbox(10)).await.unwrap();
    let second = orchestrator.classify(USER, &mixed_inbox(4)).await.unwrap();

    assert_eq!(llm.call_count(), 0);
    assert_eq!(first.results.len(), 10);
    assert!(first.results.iter().all(|r| r.engine_used == Engine::Pattern && r.fallback_used));
    assert_eq!(
        first.results[0].diagnostics.analyzer_failure.as_deref(),
        Some("budget_exceeded")
    );
    assert_eq!(
        first.notices,
        vec![ScanNotice::BudgetExceeded {
            user_id: USER.to_string(),
            period: budget_period(Utc::now()),
        }]
    );
    // Notified once per period.
    assert!(second.notices.is_empty());
}

#[tokio::test]
async fn test_budget_is_not_shared_between_users() {
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(MockLlm::new());
    let ledger = Arc::new(MemoryUsageLedger::new());
    ledger.record("other-user", &budget_period(Utc::now()), 1_000);
    let orchestrator = Orchestrator::new(
        store,
        llm.clone(),
        ledger,
        config().with_budget_cap_tokens(1_000),
    )
    .unwrap();

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 1);
    assert_eq!(outcome.results[0].engine_used, Engine::Llm);
}

#[tokio::test]
async fn test_cancellation_skips_unissued_batches() {
    let token = CancellationToken::new();
    let store = Arc::new(MemoryStore::new());
    let llm = Arc::new(MockLlm::new().cancel_after(1, token.clone()));
    let orchestrator = orchestrator_with(
        store.clone(),
        llm.clone(),
        config().with_batch_size(1).with_llm_rate(60, 1),
    );
    let messages = vec![
        transaction_message("m-1"),
        transaction_message("m-2"),
        transaction_message("m-3"),
    ];

    let outcome = orchestrator
        .classify_with_cancel(USER, &messages, token)
        .await
        .unwrap();

    assert!(outcome.cancelled);
    assert_eq!(llm.call_count(), 1);
    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.results[0].message_id, "m-1");
    assert_eq!(outcome.skipped, vec!["m-2".to_string(), "m-3".to_string()]);
    // Nothing half-written for skipped messages.
    assert_eq!(store.result_count(), 1);
}

#[tokio::test]
async fn test_failed_writes_are_held_and_flushed_next_pass() {
    let store = Arc::new(FlakyStore::new(MemoryStore::new()));
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(MockLlm::new()),
        Arc::new(MemoryUsageLedger::new()),
        config(),
    )
    .unwrap();

    store.fail_next_saves(3);
    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 1);
    assert_eq!(outcome.uncommitted, vec![outcome.results[0].id]);
    assert_eq!(orchestrator.uncommitted_count(), 1);
    assert_eq!(store.inner().result_count(), 0);

    let next = orchestrator.classify(USER, &[]).await.unwrap();

    assert_eq!(next.stats.flushed, 1);
    assert_eq!(orchestrator.uncommitted_count(), 0);
    assert_eq!(store.inner().result_count(), 1);
    let stored = store.get_result(outcome.results[0].id).await.unwrap();
    assert!(stored.is_some());
}

#[tokio::test]
async fn test_corrupt_snapshot_is_discarded() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    seed_primary_tier(&store).await;
    let key = ModelKey::detection(USER);

    let mut record = escrow_model(2).to_record().unwrap();
    record.payload = record.payload.replace("escrow", "escrov");
    store.commit_snapshot(record).await.unwrap();

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();

    assert!(outcome.notices.iter().any(|n| matches!(
        n,
        ScanNotice::ModelReset { version: 2, .. }
    )));
    assert_eq!(outcome.results[0].tier, Tier::Learning);
    assert_eq!(outcome.results[0].engine_used, Engine::Llm);
    assert_eq!(llm.call_count(), 1);

    assert_eq!(store.current_snapshot(&key).await.unwrap(), None);
    assert!(store.load_metrics(&key).await.unwrap().unwrap().is_empty());
    // Training data survives a reset.
    assert!(store.example_count(&key) >= 400);
}

#[tokio::test]
async fn test_reclassify_supersedes_previous_result() {
    let (orchestrator, store, _llm) = setup(MockLlm::new());
    let message = transaction_message("m-1");

    let first = orchestrator.classify(USER, &[message.clone()]).await.unwrap();
    let second = orchestrator.reclassify(USER, &message).await.unwrap();

    assert_eq!(second.supersedes, Some(first.results[0].id));
    let history = store.result_history(USER, "m-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        store.latest_result(USER, "m-1").await.unwrap().map(|r| r.id),
        Some(second.id)
    );
}

#[tokio::test]
async fn test_junk_is_filtered_before_analysis() {
    let (orchestrator, _store, llm) = setup(MockLlm::new());
    let spam = transaction_message("m-spam").with_label("SPAM");

    let outcome = orchestrator
        .classify(USER, &[spam, transaction_message("m-1")])
        .await
        .unwrap();

    assert_eq!(llm.items_seen(), 1);
    let filtered = outcome.result_for("m-spam").unwrap();
    assert!(!filtered.is_transaction);
    assert_eq!(filtered.engine_used, Engine::None);
    assert_eq!(outcome.stats.filtered, 1);
}

#[tokio::test]
async fn test_filtered_message_accepts_correction() {
    let (orchestrator, store, _llm) = setup(MockLlm::new());
    let spam = transaction_message("m-spam").with_label("SPAM");

    let outcome = orchestrator.classify(USER, &[spam]).await.unwrap();
    let filtered = &outcome.results[0];
    assert_eq!(filtered.origin, ResultOrigin::Filtered);
    assert!(filtered.features_ref.is_some());

    let receipt = orchestrator
        .record_feedback(
            filtered.id,
            FeedbackAction::Correct {
                is_transaction: true,
                transaction_type: Some(TransactionType::Purchase),
            },
        )
        .await
        .unwrap();

    assert_eq!(receipt.examples_added, 2);
    assert_eq!(store.example_count(&ModelKey::detection(USER)), 1);
}

#[tokio::test]
async fn test_unsanitizable_message_accepts_feedback() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    let message = Message::new(
        "m-odd",
        "Offer accepted - 42 Maple Street",
        "Escrow opened with the title company. Ref 123-45-67891 555 123 4567. \
         Earnest money is due Friday.",
        Utc::now(),
    );

    let outcome = orchestrator.classify(USER, &[message]).await.unwrap();
    let result = &outcome.results[0];
    assert_eq!(result.engine_used, Engine::Pattern);
    assert_eq!(result.diagnostics.analyzer_failure.as_deref(), Some("sanitize"));
    assert_eq!(llm.call_count(), 0);

    let receipt = orchestrator
        .record_feedback(result.id, FeedbackAction::Dismiss)
        .await
        .unwrap();

    assert_eq!(receipt.examples_added, 1);
    let examples = store
        .examples(&ModelKey::detection(USER), &Default::default())
        .await
        .unwrap();
    assert_eq!(examples.len(), 1);
    assert!(examples[0].text.contains("Escrow opened"));
}

#[tokio::test]
async fn test_correction_adds_detection_and_type_examples() {
    let (orchestrator, store, _llm) = setup(MockLlm::new());
    let outcome = orchestrator
        .classify(USER, &[newsletter_message("m-1")])
        .await
        .unwrap();
    let result = &outcome.results[0];
    assert!(!result.is_transaction);

    let receipt = orchestrator
        .record_feedback(
            result.id,
            FeedbackAction::Correct {
                is_transaction: true,
                transaction_type: Some(TransactionType::Lease),
            },
        )
        .await
        .unwrap();

    assert_eq!(receipt.examples_added, 2);
    let type_examples = store
        .examples(&ModelKey::transaction_type(USER), &Default::default())
        .await
        .unwrap();
    assert_eq!(type_examples.len(), 1);
    assert_eq!(type_examples[0].label, "lease");
    assert_eq!(type_examples[0].label_source, LabelSource::User);
}

#[tokio::test]
async fn test_feedback_for_unknown_result() {
    let (orchestrator, _store, _llm) = setup(MockLlm::new());
    let err = orchestrator
        .record_feedback(Uuid::now_v7(), FeedbackAction::Accept)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        txn_classifier::ClassifierError::ResultNotFound { .. }
    ));
}

#[tokio::test]
async fn test_regressed_model_is_rolled_back_on_feedback() {
    let (orchestrator, store, _llm) = setup(MockLlm::new());
    let key = ModelKey::detection(USER);
    store.commit_snapshot(escrow_model(1).to_record().unwrap()).await.unwrap();
    store.commit_snapshot(escrow_model(2).to_record().unwrap()).await.unwrap();

    let mut metrics = detection_metrics(10, 10, 0, 0, 1);
    for outcome in detection_metrics(5, 5, 5, 5, 2).outcomes() {
        metrics.record(outcome.clone());
    }
    store.save_metrics(&key, &metrics).await.unwrap();

    let outcome = orchestrator
        .classify(USER, &[transaction_message("m-1")])
        .await
        .unwrap();
    let receipt = orchestrator
        .record_feedback(outcome.results[0].id, FeedbackAction::Accept)
        .await
        .unwrap();

    assert_eq!(receipt.rolled_back, vec![(TaskType::TransactionDetection, 1)]);
    let current = store.current_snapshot(&key).await.unwrap().unwrap();
    assert_eq!(current.version, 1);
    assert_eq!(store.latest_version(&key).await.unwrap(), 2);
}

#[tokio::test]
async fn test_background_retraining_commits_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator_with(
        store.clone(),
        Arc::new(MockLlm::new()),
        config().with_auto_retrain(true).with_retrain_threshold(10),
    );

    orchestrator.classify(USER, &mixed_inbox(40)).await.unwrap();
    orchestrator.wait_for_training().await;

    let key = ModelKey::detection(USER);
    assert_eq!(store.example_count(&key), 40);
    let snapshot = store.current_snapshot(&key).await.unwrap().unwrap();
    assert_eq!(snapshot.version, 1);

    let status = orchestrator
        .graduation_status(USER, TaskType::TransactionDetection)
        .await
        .unwrap();
    assert_eq!(status.model_version, Some(1));
    // 40 examples is below the tier 2 floor of 50.
    assert_eq!(status.tier, Tier::Learning);
    assert_eq!(status.examples_needed_for_next_tier, Some(10));
}

#[tokio::test]
async fn test_retrain_now_requires_two_classes() {
    let (orchestrator, store, _llm) = setup(MockLlm::new());
    let key = ModelKey::detection(USER);
    for _ in 0..20 {
        store
            .append_example(&TrainingExample::new(
                key.clone(),
                "escrow opens monday",
                "transaction",
                LabelSource::User,
            ))
            .await
            .unwrap();
    }

    let err = orchestrator
        .retrain_now(USER, TaskType::TransactionDetection)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        txn_classifier::ClassifierError::Training(txn_classifier::TrainingError::SingleClass { .. })
    ));
}

#[tokio::test]
async fn test_models_are_isolated_per_user() {
    let (orchestrator, store, llm) = setup(MockLlm::new());
    seed_primary_tier(&store).await;

    let outcome = orchestrator
        .classify("someone-else", &[transaction_message("m-1")])
        .await
        .unwrap();

    assert_eq!(outcome.results[0].tier, Tier::Learning);
    assert_eq!(outcome.results[0].engine_used, Engine::Llm);
    assert_eq!(llm.call_count(), 1);
}
