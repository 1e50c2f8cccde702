//! LLM gateway.
//!
//! One public operation matters to the pipeline:
//! [`client::LlmGateway::generate_structured`] — render a named/versioned
//! prompt template, issue the provider call with retry classification and
//! bounded backoff, validate the response as structured JSON, run at most
//! one repair round-trip on validation failure, and record telemetry.
//!
//! Providers implement [`providers::LlmProvider`] and are single-attempt;
//! retries and backoff live in the client.

pub mod client;
pub mod prompts;
pub mod providers;
pub mod telemetry;
pub mod types;

pub use client::LlmGateway;

use thiserror::Error;

/// Errors returned by the gateway and providers, classified for retry.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Transient failure: timeouts, 429s, 5xx, network. Worth retrying.
    #[error("retryable llm failure: {0}")]
    Retryable(String),
    /// Auth, malformed request, prompt too large, schema bind failure.
    /// Surfaced immediately; never retried.
    #[error("non-retryable llm failure: {0}")]
    NonRetryable(String),
}

impl LlmError {
    /// Short classification tag for telemetry.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Retryable(_) => "LlmRetryable",
            Self::NonRetryable(_) => "LlmNonRetryable",
        }
    }
}
