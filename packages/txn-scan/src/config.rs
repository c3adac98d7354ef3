use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::path::Path;
use std::str::FromStr;

use txn_classifier::ClassifierConfig;

/// Runner configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    pub classifier: ClassifierConfig,
}

impl Config {
    /// Load configuration from an optional JSON file, then apply `TXN_*`
    /// environment overrides.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let mut classifier = match config_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Invalid config file {}", path.display()))?
            }
            None => ClassifierConfig::default(),
        };

        if let Some(size) = parse_var("TXN_BATCH_SIZE")? {
            classifier.batch_size = size;
        }
        if let Some(threshold) = parse_var("TXN_CONFIDENCE_THRESHOLD")? {
            classifier.confidence_threshold = threshold;
        }
        if let Some(tokens) = parse_var("TXN_BUDGET_CAP_TOKENS")? {
            classifier.budget_cap_tokens = Some(tokens);
        }
        if let Some(usd) = parse_var("TXN_BUDGET_CAP_USD")? {
            classifier.budget_cap_cost = Some(usd);
        }
        if let Some(threshold) = parse_var("TXN_RETRAIN_THRESHOLD")? {
            classifier.retrain_example_threshold = threshold;
        }
        if let Some(ms) = parse_var("TXN_LLM_TIMEOUT_MS")? {
            classifier.llm_timeout_ms = ms;
        }
        if let Some(concurrency) = parse_var("TXN_LLM_CONCURRENCY")? {
            classifier.llm_max_concurrency = concurrency;
        }

        classifier
            .validate()
            .context("Invalid classifier configuration")?;

        Ok(Self {
            openai_api_key: env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            openai_model: env::var("TXN_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            openai_base_url: env::var("OPENAI_BASE_URL").ok(),
            classifier,
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} must be a valid number")),
        Err(_) => Ok(None),
    }
}
