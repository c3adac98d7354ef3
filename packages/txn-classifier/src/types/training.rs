//! Training data types shared by the feedback loop and the local classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Positive class of the detection task.
pub const TRANSACTION_CLASS: &str = "transaction";

/// Negative class of the detection task.
pub const NOT_TRANSACTION_CLASS: &str = "not_transaction";

/// Classification tasks with independent models, metrics and tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Binary: is this message part of a real-estate transaction?
    TransactionDetection,
    /// Multi-class: which kind of transaction?
    TransactionType,
}

impl TaskType {
    pub const ALL: [TaskType; 2] = [TaskType::TransactionDetection, TaskType::TransactionType];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::TransactionDetection => "transaction_detection",
            TaskType::TransactionType => "transaction_type",
        }
    }

    /// Class names in model order.
    pub fn classes(&self) -> Vec<String> {
        match self {
            TaskType::TransactionDetection => {
                vec![NOT_TRANSACTION_CLASS.to_string(), TRANSACTION_CLASS.to_string()]
            }
            TaskType::TransactionType => TransactionType::ALL
                .iter()
                .map(|t| t.as_str().to_string())
                .collect(),
        }
    }

    /// Positive class for binary metrics (None = micro-averaged multi-class).
    pub fn positive_class(&self) -> Option<&'static str> {
        match self {
            TaskType::TransactionDetection => Some(TRANSACTION_CLASS),
            TaskType::TransactionType => None,
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Partition key for all mutable per-user state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelKey {
    pub user_id: String,
    pub task: TaskType,
}

impl ModelKey {
    pub fn new(user_id: impl Into<String>, task: TaskType) -> Self {
        Self {
            user_id: user_id.into(),
            task,
        }
    }

    pub fn detection(user_id: impl Into<String>) -> Self {
        Self::new(user_id, TaskType::TransactionDetection)
    }

    pub fn transaction_type(user_id: impl Into<String>) -> Self {
        Self::new(user_id, TaskType::TransactionType)
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.task)
    }
}

/// Kind of real-estate transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    Sale,
    Lease,
    Refinance,
    Other,
}

impl TransactionType {
    pub const ALL: [TransactionType; 5] = [
        TransactionType::Purchase,
        TransactionType::Sale,
        TransactionType::Lease,
        TransactionType::Refinance,
        TransactionType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Sale => "sale",
            TransactionType::Lease => "lease",
            TransactionType::Refinance => "refinance",
            TransactionType::Other => "other",
        }
    }

    /// Parse a class name, accepting a few common synonyms.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "purchase" | "buy" | "buying" | "acquisition" => Some(TransactionType::Purchase),
            "sale" | "sell" | "selling" | "listing" => Some(TransactionType::Sale),
            "lease" | "rental" | "rent" => Some(TransactionType::Lease),
            "refinance" | "refi" => Some(TransactionType::Refinance),
            "other" => Some(TransactionType::Other),
            _ => None,
        }
    }
}

/// Who supplied a training label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSource {
    /// Synthesized from confident LLM/pattern agreement
    Llm,
    /// Explicit user accept/dismiss/correct action
    User,
}

/// A labeled example for local model training. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub id: Uuid,
    pub key: ModelKey,
    /// Result the label was derived from, if any
    pub result_id: Option<Uuid>,
    /// Content hash of the sanitized feature text
    pub features_ref: String,
    /// Sanitized feature text
    pub text: String,
    /// Class name (see [`TaskType::classes`])
    pub label: String,
    pub label_source: LabelSource,
    pub created_at: DateTime<Utc>,
}

impl TrainingExample {
    pub fn new(
        key: ModelKey,
        text: impl Into<String>,
        label: impl Into<String>,
        label_source: LabelSource,
    ) -> Self {
        let text = text.into();
        Self {
            id: Uuid::now_v7(),
            key,
            result_id: None,
            features_ref: features_ref(&text),
            text,
            label: label.into(),
            label_source,
            created_at: Utc::now(),
        }
    }

    pub fn for_result(mut self, result_id: Uuid) -> Self {
        self.result_id = Some(result_id);
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Rolling window over training examples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingWindow {
    /// Most recent N examples
    pub max_examples: usize,
    /// Ignore examples older than this many days
    pub max_age_days: i64,
}

impl Default for TrainingWindow {
    fn default() -> Self {
        Self {
            max_examples: 5000,
            max_age_days: 365,
        }
    }
}

impl TrainingWindow {
    pub fn admits(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(created_at).num_days() <= self.max_age_days
    }
}

/// Class label for a binary detection decision.
pub fn detection_label(is_transaction: bool) -> &'static str {
    if is_transaction {
        TRANSACTION_CLASS
    } else {
        NOT_TRANSACTION_CLASS
    }
}

/// Content-addressed reference for feature text.
pub fn features_ref(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}
