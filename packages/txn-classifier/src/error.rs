//! Typed errors for the classification pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match on
//! the failure class and pick the right degradation path.

use thiserror::Error;

use crate::types::training::ModelKey;

/// Errors surfaced by the classification pipeline.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// LLM analysis failed (always recoverable via pattern fallback)
    #[error("analyzer failure: {0}")]
    Analyzer(#[from] AnalyzerError),

    /// Text could not be sanitized; it must not leave the process
    #[error("sanitization failed: {0}")]
    Sanitize(#[from] SanitizeError),

    /// Stored model snapshot could not be decoded
    #[error("model snapshot for {key} v{version} is corrupt: {reason}")]
    ModelCorruption {
        key: ModelKey,
        version: i64,
        reason: String,
    },

    /// Local model training failed
    #[error("training failed: {0}")]
    Training(#[from] TrainingError),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Result referenced by feedback does not exist
    #[error("classification result not found: {id}")]
    ResultNotFound { id: uuid::Uuid },

    /// Feature text referenced by a result is missing
    #[error("features not found: {features_ref}")]
    FeaturesNotFound { features_ref: String },

    /// Invalid configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClassifierError {
    /// Wrap any error as a storage failure.
    pub fn storage(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Storage(err.into())
    }
}

/// Failures of the cloud LLM analyzer.
///
/// None of these are user-facing: the orchestrator degrades to pattern-only
/// classification and marks the result with `fallback_used`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalyzerError {
    /// Request exceeded the per-call timeout
    #[error("LLM call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// Response could not be parsed into per-message verdicts
    #[error("malformed LLM response: {0}")]
    Malformed(String),

    /// Provider rejected the credential
    #[error("invalid LLM credential")]
    InvalidCredential,

    /// Provider rate limited the request
    #[error("LLM provider rate limited the request")]
    RateLimited,

    /// Network or 5xx failure
    #[error("LLM transport error: {0}")]
    Transport(String),

    /// Per-user budget for the current period is spent
    #[error("LLM budget exceeded for period {period}")]
    BudgetExceeded { period: String },

    /// Analyzer not usable (no backend, ledger unavailable, cancelled)
    #[error("LLM analyzer unavailable: {0}")]
    Unavailable(String),
}

impl AnalyzerError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AnalyzerError::Timeout { .. } | AnalyzerError::RateLimited | AnalyzerError::Transport(_)
        )
    }

    /// Short machine-readable tag used in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalyzerError::Timeout { .. } => "timeout",
            AnalyzerError::Malformed(_) => "malformed",
            AnalyzerError::InvalidCredential => "invalid_credential",
            AnalyzerError::RateLimited => "rate_limited",
            AnalyzerError::Transport(_) => "transport",
            AnalyzerError::BudgetExceeded { .. } => "budget_exceeded",
            AnalyzerError::Unavailable(_) => "unavailable",
        }
    }
}

/// Redaction failures. Any of these blocks the external call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SanitizeError {
    /// A PII pattern still matched after redaction
    #[error("residual {kind} found after redaction")]
    ResidualPii { kind: &'static str },
}

/// Local model training failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrainingError {
    /// Not enough examples in the rolling window
    #[error("insufficient training examples: have {have}, need {need}")]
    InsufficientExamples { have: usize, need: usize },

    /// All examples carry the same label
    #[error("training window contains a single class: {class}")]
    SingleClass { class: String },

    /// Vocabulary came out empty (no usable tokens)
    #[error("empty vocabulary")]
    EmptyVocabulary,

    /// Weights diverged
    #[error("non-finite weights after training")]
    Diverged,
}

/// Configuration validation failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} is not set")]
    Missing { field: &'static str },

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("{field} must be within [0, 1], got {value}")]
    OutOfRange { field: &'static str, value: f32 },

    #[error("tier {tier}: recall floor {recall} must exceed precision floor {precision}")]
    RecallBelowPrecision {
        tier: u8,
        recall: f32,
        precision: f32,
    },

    #[error("tier {tier}: {field} floor is lower than tier {previous}")]
    NonMonotonicFloor {
        tier: u8,
        previous: u8,
        field: &'static str,
    },
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, ClassifierError>;

/// Result type alias for analyzer operations.
pub type AnalyzerResult<T> = std::result::Result<T, AnalyzerError>;
