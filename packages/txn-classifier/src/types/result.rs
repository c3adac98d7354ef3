//! Classification results and their audit metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{message::ThreadKey, tier::Tier, training::TransactionType};

/// Categorical confidence band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl ConfidenceLevel {
    pub const HIGH_FLOOR: f32 = 0.85;
    pub const MEDIUM_FLOOR: f32 = 0.60;

    pub fn from_score(score: f32) -> Self {
        if score >= Self::HIGH_FLOOR {
            ConfidenceLevel::High
        } else if score >= Self::MEDIUM_FLOOR {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    /// One category lower (Low stays Low).
    pub fn demote(self) -> Self {
        match self {
            ConfidenceLevel::High => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::Low,
        }
    }
}

/// Engine whose output decided the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// Short-circuited by the ingestion filter
    None,
    Pattern,
    Llm,
    Local,
    /// LLM decided with the local model concurring
    Hybrid,
}

/// Per-engine probability that the message is transaction-related.
///
/// `None` means the engine was not invoked (or failed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceScores {
    pub pattern: Option<f32>,
    pub llm: Option<f32>,
    pub local: Option<f32>,
}

/// How a result came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultOrigin {
    /// Classified directly by the engines
    Direct,
    /// Copied from the thread representative's result
    Propagated {
        representative_message_id: String,
        representative_result_id: Uuid,
    },
    /// Rejected by the ingestion filter
    Filtered,
}

/// Structured entities returned by the LLM (passed through, not interpreted).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TransactionEntities {
    #[serde(default)]
    pub parties: Vec<Party>,
    #[serde(default)]
    pub dates: Vec<KeyDate>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub property_address: Option<String>,
}

impl TransactionEntities {
    pub fn is_empty(&self) -> bool {
        self.parties.is_empty()
            && self.dates.is_empty()
            && self.price.is_none()
            && self.property_address.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct Party {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct KeyDate {
    pub label: String,
    pub date: String,
}

/// Raw engine votes kept for the feedback loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultDiagnostics {
    /// Local detection model's label, whether or not it was surfaced
    pub local_is_transaction: Option<bool>,
    /// Local type model's label
    pub local_transaction_type: Option<TransactionType>,
    /// Local snapshot versions used (detection, type)
    pub local_versions: (Option<i64>, Option<i64>),
    /// LLM verdict and its confidence
    pub llm_is_transaction: Option<bool>,
    pub llm_confidence: Option<f32>,
    pub llm_transaction_type: Option<TransactionType>,
    /// Pattern matcher's label
    pub pattern_is_transaction: bool,
    /// Analyzer failure tag when the LLM failed
    pub analyzer_failure: Option<String>,
}

/// Decision for one message. Immutable once persisted; re-classification
/// appends a new result that supersedes the old one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub id: Uuid,
    pub user_id: String,
    pub message_id: String,
    pub thread_key: ThreadKey,
    /// When the message was sent; orders a thread across passes
    pub sent_at: DateTime<Utc>,

    pub is_transaction: bool,
    /// Confidence in `is_transaction`, in [0, 1]
    pub confidence: f32,
    pub level: ConfidenceLevel,
    pub source_scores: SourceScores,
    pub engine_used: Engine,
    /// "local:v{n}" or the LLM model id
    pub model_version: Option<String>,
    pub fallback_used: bool,
    pub tier: Tier,
    pub origin: ResultOrigin,

    pub transaction_type: Option<TransactionType>,
    pub entities: Option<TransactionEntities>,
    #[serde(default)]
    pub matched_signals: Vec<String>,
    /// Reference to the stored sanitized feature text
    pub features_ref: Option<String>,
    #[serde(default)]
    pub diagnostics: ResultDiagnostics,

    /// Previous result for the same message
    pub supersedes: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ClassificationResult {
    /// Result for a message rejected by the ingestion filter.
    pub fn filtered(user_id: &str, message_id: &str, thread_key: ThreadKey) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            thread_key,
            sent_at: Utc::now(),
            is_transaction: false,
            confidence: 1.0,
            level: ConfidenceLevel::High,
            source_scores: SourceScores::default(),
            engine_used: Engine::None,
            model_version: None,
            fallback_used: false,
            tier: Tier::Learning,
            origin: ResultOrigin::Filtered,
            transaction_type: None,
            entities: None,
            matched_signals: Vec::new(),
            features_ref: None,
            diagnostics: ResultDiagnostics::default(),
            supersedes: None,
            created_at: Utc::now(),
        }
    }

    /// Copy this (representative) decision onto a sibling message.
    pub fn propagate_to(&self, message_id: &str, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            message_id: message_id.to_string(),
            sent_at,
            origin: ResultOrigin::Propagated {
                representative_message_id: self.message_id.clone(),
                representative_result_id: self.id,
            },
            features_ref: None,
            supersedes: None,
            created_at: Utc::now(),
            ..self.clone()
        }
    }

    pub fn is_propagated(&self) -> bool {
        matches!(self.origin, ResultOrigin::Propagated { .. })
    }

    /// True when both results carry the same decision, regardless of which
    /// message they belong to.
    pub fn same_decision(&self, other: &ClassificationResult) -> bool {
        self.is_transaction == other.is_transaction
            && self.confidence == other.confidence
            && self.level == other.level
            && self.source_scores == other.source_scores
            && self.engine_used == other.engine_used
            && self.model_version == other.model_version
            && self.fallback_used == other.fallback_used
            && self.tier == other.tier
            && self.transaction_type == other.transaction_type
    }
}
