//! LLM backend trait.
//!
//! A backend performs one structured completion per batch. It never sees raw
//! message text: batch items only carry [`SanitizedText`], which can only be
//! produced by the content sanitizer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AnalyzerResult;
use crate::pipeline::sanitize::SanitizedText;

/// One representative message in a batch.
#[derive(Debug, Clone)]
pub struct BatchItem {
    /// Message id, echoed back in the response
    pub id: String,
    pub sender_domain: String,
    pub text: SanitizedText,
}

/// A batch of representatives for one user.
#[derive(Debug, Clone)]
pub struct LlmBatch {
    pub user_id: String,
    pub items: Vec<BatchItem>,
}

impl LlmBatch {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, item: BatchItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Rough token estimate used for budget reservation.
    pub fn estimated_tokens(&self) -> u64 {
        self.items
            .iter()
            .map(|item| item.text.as_str().chars().count() as u64 / 4 + 60)
            .sum()
    }
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Raw completion for a batch.
#[derive(Debug, Clone)]
pub struct LlmCompletion {
    /// Response body; expected to be the JSON document described in
    /// [`crate::pipeline::prompts`]
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// Cloud LLM used for batched transaction analysis.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Model identifier recorded on results.
    fn model_id(&self) -> &str;

    /// Run one completion for the batch.
    async fn complete(&self, batch: &LlmBatch) -> AnalyzerResult<LlmCompletion>;
}
