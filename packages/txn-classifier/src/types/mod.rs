//! Core data types for the classification pipeline.

pub mod config;
pub mod message;
pub mod metrics;
pub mod result;
pub mod tier;
pub mod training;

pub use config::{ClassifierConfig, TierFloor, TierFloors, TrainingParams};
pub use message::{AttachmentSummary, Message, ThreadKey};
pub use metrics::{ConfusionCounts, MetricsSummary, MetricsWindow, ModelMetrics, Outcome};
pub use result::{
    ClassificationResult, ConfidenceLevel, Engine, KeyDate, Party, ResultDiagnostics,
    ResultOrigin, SourceScores, TransactionEntities,
};
pub use tier::{Tier, TierBehavior};
pub use training::{
    detection_label, features_ref, LabelSource, ModelKey, TaskType, TrainingExample,
    TrainingWindow, TransactionType, NOT_TRANSACTION_CLASS, TRANSACTION_CLASS,
};
