//! Reference [`LlmBackend`](crate::traits::llm::LlmBackend) implementations.

#[cfg(feature = "openai")]
mod openai;

#[cfg(feature = "openai")]
pub use openai::OpenAiBackend;
