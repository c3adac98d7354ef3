//! Classification pipeline.
//!
//! The pipeline is organized into stages:
//! - `filter`: drop provider-marked junk before any work
//! - `threads`: group messages and pick one representative per thread
//! - `sanitize`: redact PII before anything leaves the process
//! - `patterns`: zero-cost rule scoring
//! - `analyzer`: batched, budgeted, rate-limited cloud LLM calls
//! - `aggregate`: combine engine votes into one confidence
//! - `graduation`: tier computation from examples and live metrics
//! - `feedback`: user actions and LLM seeding into training data
//! - `orchestrator`: the end-to-end pass

pub mod aggregate;
pub mod analyzer;
pub mod feedback;
pub mod filter;
pub mod graduation;
pub mod locks;
pub mod orchestrator;
pub mod patterns;
pub mod prompts;
pub mod sanitize;
pub mod threads;

pub use aggregate::{Aggregate, AggregateInput, Authority, ConfidenceAggregator, EngineVote};
pub use analyzer::{AnalyzerSettings, AnalyzerStats, BatchVerdicts, LlmAnalyzer, LlmVerdict};
pub use feedback::{FeedbackAction, FeedbackReceipt, FeedbackRecorder};
pub use filter::IngestionFilter;
pub use graduation::{GraduationPolicy, GraduationStatus};
pub use locks::KeyedLocks;
pub use orchestrator::{Orchestrator, ScanNotice, ScanOutcome, ScanStats};
pub use patterns::{PatternMatcher, PatternScore};
pub use prompts::{parse_response, render_batch, response_schema, BatchResponse, ItemVerdict};
pub use sanitize::{compose, ContentSanitizer, SanitizedText};
pub use threads::{ThreadIndex, ThreadView};
