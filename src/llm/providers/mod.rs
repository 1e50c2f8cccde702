//! Provider abstraction.
//!
//! A provider performs exactly one attempt per call; the gateway client
//! owns retries, backoff, and repair. One logical provider is active at a
//! time, selected by configuration (default `gemini`).

use async_trait::async_trait;

use super::types::LlmRequest;
use super::LlmError;

pub mod gemini;

/// What a provider returns for one attempt.
#[derive(Debug, Clone)]
pub struct ProviderOutput {
    /// Response text.
    pub text: String,
    /// Prompt token count, when reported.
    pub input_tokens: Option<u32>,
    /// Output token count, when reported.
    pub output_tokens: Option<u32>,
}

/// Single-attempt LLM provider interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Issue one generation attempt.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Retryable`] for transient failures (the client
    /// retries with backoff) and [`LlmError::NonRetryable`] otherwise.
    async fn generate(&self, request: &LlmRequest, prompt: &str)
        -> Result<ProviderOutput, LlmError>;
}
