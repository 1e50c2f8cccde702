//! Shared request/response types for the gateway and providers.

use std::time::Duration;

/// A fully-specified provider call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    /// UUID assigned per gateway invocation; threads through telemetry.
    pub trace_id: String,
    /// What the call is for, e.g. `parse_matrix`, `generate_examples_batch`.
    pub purpose: String,
    /// Prompt registry key.
    pub prompt_name: String,
    /// Prompt registry version, e.g. `v1`.
    pub prompt_version: String,
    /// Logical provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Output token ceiling.
    pub max_output_tokens: u32,
    /// Per-call HTTP timeout.
    pub timeout: Duration,
    /// Response MIME type; `application/json` for structured calls.
    pub response_mime_type: Option<String>,
}

/// A provider response plus gateway-level metadata.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Trace id of the originating request.
    pub trace_id: String,
    /// Provider that served the call.
    pub provider: String,
    /// Model that served the call.
    pub model: String,
    /// Raw output text.
    pub output_text: String,
    /// Wall-clock latency across all attempts.
    pub latency_ms: u64,
    /// Retries consumed before this response.
    pub retries: u32,
    /// Prompt token count when the provider reports it.
    pub input_tokens: Option<u32>,
    /// Output token count when the provider reports it.
    pub output_tokens: Option<u32>,
}
