//! Classify a JSON file of messages from the command line.
//!
//! Reads a JSON array of messages, runs one classification pass for a user
//! and prints the results and graduation status as JSON.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use txn_classifier::pipeline::response_schema;
use txn_classifier::{
    ClassificationResult, GraduationStatus, LlmBackend, MemoryStore, MemoryUsageLedger, Message,
    MockLlm, OpenAiBackend, Orchestrator, ScanNotice, ScanStats, TaskType,
};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "txscan")]
#[command(about = "Detect real-estate transaction messages")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a JSON array of messages
    Classify {
        /// User the messages belong to
        #[arg(long)]
        user: String,

        /// Path to a JSON array of messages
        #[arg(long)]
        input: PathBuf,

        /// Optional JSON classifier config (missing fields use defaults)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use the offline keyword mock instead of OpenAI
        #[arg(long)]
        mock: bool,
    },

    /// Print the JSON schema the LLM must answer with
    Schema,
}

#[derive(Serialize)]
struct Report {
    results: Vec<ClassificationResult>,
    skipped: Vec<String>,
    uncommitted: usize,
    notices: Vec<ScanNotice>,
    stats: ScanStats,
    cancelled: bool,
    graduation: Vec<GraduationStatus>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,txn_classifier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(&response_schema())?);
        }
        Commands::Classify {
            user,
            input,
            config,
            mock,
        } => {
            let config = Config::load(config.as_deref()).context("Failed to load configuration")?;
            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let messages: Vec<Message> = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a JSON array of messages", input.display()))?;
            tracing::info!(user = %user, messages = messages.len(), "Loaded messages");

            let report = if mock {
                run(Arc::new(MockLlm::new()), config, &user, &messages).await?
            } else {
                let api_key = config
                    .openai_api_key
                    .clone()
                    .context("OPENAI_API_KEY must be set (or pass --mock)")?;
                let mut backend = OpenAiBackend::new(api_key).with_model(&config.openai_model);
                if let Some(url) = &config.openai_base_url {
                    backend = backend.with_base_url(url);
                }
                run(Arc::new(backend), config, &user, &messages).await?
            };

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn run<B: LlmBackend + 'static>(
    backend: Arc<B>,
    config: Config,
    user: &str,
    messages: &[Message],
) -> Result<Report> {
    let orchestrator = Orchestrator::new(
        Arc::new(MemoryStore::new()),
        backend,
        Arc::new(MemoryUsageLedger::new()),
        config.classifier,
    )
    .context("Failed to build classifier")?;

    // Ctrl-C stops issuing new LLM batches; finished work is still reported.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing in-flight batches");
            on_signal.cancel();
        }
    });

    let outcome = orchestrator
        .classify_with_cancel(user, messages, cancel)
        .await
        .context("Classification pass failed")?;
    orchestrator.wait_for_training().await;

    let mut graduation = Vec::new();
    for task in TaskType::ALL {
        graduation.push(
            orchestrator
                .graduation_status(user, task)
                .await
                .with_context(|| format!("Failed to read graduation status for {task}"))?,
        );
    }

    let stats = orchestrator.analyzer_stats();
    tracing::info!(
        requests = stats.requests_issued,
        items = stats.items_analyzed,
        "LLM usage"
    );

    Ok(Report {
        results: outcome.results,
        skipped: outcome.skipped,
        uncommitted: outcome.uncommitted.len(),
        notices: outcome.notices,
        stats: outcome.stats,
        cancelled: outcome.cancelled,
        graduation,
    })
}
