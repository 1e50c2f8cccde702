//! Gemini provider over the `generateContent` REST API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::types::LlmRequest;
use crate::llm::LlmError;

use super::{LlmProvider, ProviderOutput};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct GeminiRequest<'a> {
    contents: Vec<GeminiContent<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig<'a>,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    parts: Vec<GeminiPart<'a>>,
}

#[derive(Debug, Serialize)]
struct GeminiPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GenerationConfig<'a> {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Gemini REST provider. Single-attempt; the gateway client owns retries.
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    /// Build a provider. The API key is checked at call time so the
    /// gateway can be constructed for subcommands that never call out.
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

/// Map a non-success HTTP status to a classified error.
fn classify_status(status: u16, body: &str) -> LlmError {
    let lower = body.to_lowercase();
    if status == 429 || status >= 500 || lower.contains("temporarily") {
        LlmError::Retryable(format!("gemini returned status {status}: {body}"))
    } else {
        LlmError::NonRetryable(format!("gemini returned status {status}: {body}"))
    }
}

fn truncate_body(body: &str) -> String {
    const MAX_BODY_CHARS: usize = 256;
    let collapsed: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_BODY_CHARS).collect()
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    async fn generate(
        &self,
        request: &LlmRequest,
        prompt: &str,
    ) -> Result<ProviderOutput, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::NonRetryable("GEMINI_API_KEY is missing".to_string()));
        }

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_output_tokens,
                response_mime_type: request.response_mime_type.as_deref(),
            },
        };

        let url = format!("{GEMINI_API_BASE}/{}:generateContent", request.model);
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Retryable(format!("gemini call timed out: {e}"))
                } else {
                    LlmError::Retryable(format!("gemini http error: {e}"))
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Retryable(format!("gemini body read failed: {e}")))?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &truncate_body(&text)));
        }

        let parsed: GeminiResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::NonRetryable(format!("gemini response parse error: {e}")))?;

        let output_text: String = parsed
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
            .trim()
            .to_string();

        let usage = parsed.usage_metadata;
        Ok(ProviderOutput {
            text: output_text,
            input_tokens: usage.as_ref().and_then(|u| u.prompt_token_count),
            output_tokens: usage.as_ref().and_then(|u| u.candidates_token_count),
        })
    }
}
