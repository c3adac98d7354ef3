//! Trait seams to external collaborators.
//!
//! Applications implement these to plug in persistence, usage accounting
//! and the cloud LLM.

pub mod budget;
pub mod llm;
pub mod store;

pub use budget::{budget_period, BudgetCap, Reservation, Usage, UsageLedger};
pub use llm::{BatchItem, LlmBackend, LlmBatch, LlmCompletion, TokenUsage};
pub use store::{ClassifierStore, MetricsStore, ResultStore, SnapshotStore, TrainingStore};
