//! LLM prompt and structured response format for batch analysis.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::AnalyzerError;
use crate::traits::llm::LlmBatch;
use crate::types::result::TransactionEntities;

/// System prompt for transaction detection.
pub const SYSTEM_PROMPT: &str = r#"You review emails and text messages for a real-estate professional.

For each message decide whether it is part of a real-estate transaction: a purchase, sale, lease or refinance of a specific property that involves the recipient (offers, contracts, escrow, inspections, appraisals, closing logistics, lender or title correspondence).

Marketing, newsletters, market reports, listing alerts and generic industry news are NOT transactions.

Personal data has been replaced with tokens such as [EMAIL], [PHONE], [SSN] and [CARD]. Do not guess the redacted values.

Return one result per message id. When unsure, prefer is_transaction = true with a lower confidence: a missed transaction costs more than a false alarm."#;

/// Prompt for a batch; message texts are already sanitized.
pub const BATCH_PROMPT: &str = r#"Classify each message below.

Output JSON:
{
    "results": [
        {
            "id": "message id, copied exactly",
            "is_transaction": true | false,
            "confidence": 0.0 to 1.0,
            "transaction_type": "purchase" | "sale" | "lease" | "refinance" | "other" | null,
            "entities": {
                "parties": [{"name": "...", "role": "buyer | seller | agent | lender | ..."}],
                "dates": [{"label": "closing | inspection | ...", "date": "YYYY-MM-DD"}],
                "price": "$..." | null,
                "property_address": "..." | null
            } | null
        }
    ]
}

Messages:
{messages}"#;

/// Verdict for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ItemVerdict {
    pub id: String,
    pub is_transaction: bool,
    pub confidence: f32,
    #[serde(default)]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub entities: Option<TransactionEntities>,
}

/// Full batch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BatchResponse {
    pub results: Vec<ItemVerdict>,
}

/// Render the user prompt for a batch.
pub fn render_batch(batch: &LlmBatch) -> String {
    let messages = batch
        .items
        .iter()
        .map(|item| {
            format!(
                "--- id: {} (sender domain: {})\n{}",
                item.id,
                if item.sender_domain.is_empty() {
                    "unknown"
                } else {
                    item.sender_domain.as_str()
                },
                item.text.as_str()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n");
    BATCH_PROMPT.replace("{messages}", &messages)
}

/// JSON schema of [`BatchResponse`] for structured-output providers.
pub fn response_schema() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(BatchResponse)).unwrap_or_default()
}

/// Parse a completion, tolerating a surrounding markdown code fence.
pub fn parse_response(content: &str) -> Result<BatchResponse, AnalyzerError> {
    let body = strip_code_fence(content);
    let response: BatchResponse =
        serde_json::from_str(body).map_err(|e| AnalyzerError::Malformed(e.to_string()))?;

    if let Some(bad) = response
        .results
        .iter()
        .find(|v| !v.confidence.is_finite() || !(0.0..=1.0).contains(&v.confidence))
    {
        return Err(AnalyzerError::Malformed(format!(
            "confidence {} out of range for {}",
            bad.confidence, bad.id
        )));
    }
    Ok(response)
}

fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip an optional language tag on the fence line.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}
