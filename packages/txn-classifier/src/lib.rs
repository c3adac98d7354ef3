//! Hybrid Transaction Classifier
//!
//! Decides which of a real-estate professional's emails and texts belong to
//! a transaction (purchase, sale, lease, refinance), and progressively hands
//! that decision from a cloud LLM to a per-user local model as the local
//! model proves itself on the user's own feedback.
//!
//! # Pipeline
//!
//! 1. Junk filter (provider spam/promotions labels)
//! 2. Thread grouping; one representative per thread
//! 3. Pattern scoring, and local inference from tier 2 on
//! 4. Routing by graduation tier: local, batched LLM, or pattern fallback
//! 5. Confidence aggregation and persistence
//! 6. Propagation to thread siblings
//! 7. Training data from feedback and high-confidence LLM agreement
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use txn_classifier::{ClassifierConfig, MemoryStore, MemoryUsageLedger, Orchestrator};
//! use txn_classifier::testing::MockLlm;
//!
//! let orchestrator = Orchestrator::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MockLlm::new()),
//!     Arc::new(MemoryUsageLedger::new()),
//!     ClassifierConfig::default(),
//! )?;
//!
//! let outcome = orchestrator.classify("agent-42", &messages).await?;
//! for result in &outcome.results {
//!     println!("{} -> {} ({:?})", result.message_id, result.is_transaction, result.level);
//! }
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Seams for storage, usage accounting and the LLM backend
//! - [`types`] - Messages, results, tiers, metrics and configuration
//! - [`pipeline`] - Filtering, routing, aggregation and the orchestrator
//! - [`local`] - Per-user TF-IDF models, training and rollback
//! - [`stores`] - In-memory storage implementations
//! - [`testing`] - Mock implementations for testing

pub mod error;
pub mod local;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

#[cfg(feature = "openai")]
pub mod ai;

// Re-export core types at crate root
pub use error::{
    AnalyzerError, ClassifierError, ConfigError, Result, SanitizeError, TrainingError,
};
pub use traits::{
    budget::{budget_period, BudgetCap, Reservation, Usage, UsageLedger},
    llm::{BatchItem, LlmBackend, LlmBatch, LlmCompletion, TokenUsage},
    store::{ClassifierStore, MetricsStore, ResultStore, SnapshotStore, TrainingStore},
};
pub use types::{
    config::{ClassifierConfig, TierFloor, TierFloors, TrainingParams},
    message::{AttachmentSummary, Message, ThreadKey},
    metrics::{ConfusionCounts, MetricsSummary, MetricsWindow, ModelMetrics, Outcome},
    result::{
        ClassificationResult, ConfidenceLevel, Engine, KeyDate, Party, ResultDiagnostics,
        ResultOrigin, SourceScores, TransactionEntities,
    },
    tier::{Tier, TierBehavior},
    training::{LabelSource, ModelKey, TaskType, TrainingExample, TrainingWindow, TransactionType},
};

// Re-export the orchestrator and its outputs
pub use pipeline::{
    FeedbackAction, FeedbackReceipt, GraduationPolicy, GraduationStatus, Orchestrator,
    ScanNotice, ScanOutcome, ScanStats,
};

// Re-export local models
pub use local::{LocalClassifier, ModelSnapshot, Prediction, SnapshotRecord, TrainedSnapshot};

// Re-export stores
pub use stores::{MemoryStore, MemoryUsageLedger};

#[cfg(feature = "openai")]
pub use ai::OpenAiBackend;

// Re-export testing utilities
pub use testing::{FlakyStore, MockLlm};
