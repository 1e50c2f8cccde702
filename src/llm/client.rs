//! Gateway client: template rendering, the provider retry loop, structured
//! validation with a single repair round-trip, and telemetry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::config::LlmSettings;

use super::prompts::{self, REPAIR_INSTRUCTIONS_KEY};
use super::providers::gemini::GeminiProvider;
use super::providers::LlmProvider;
use super::telemetry::{record_llm_call, LlmCallRecord};
use super::types::{LlmRequest, LlmResponse};
use super::LlmError;

/// Stock instructions appended when a structured response fails validation.
const REPAIR_INSTRUCTIONS: &str = "You MUST return valid JSON only. \
Escape all quotes and newlines inside strings. \
Do not include any raw line breaks inside string values. \
No markdown. No trailing commas. \
Return EXACTLY the schema with correct types.";

/// Purposes that need room for a whole matrix in one response.
const PARSE_MATRIX_PURPOSE: &str = "parse_matrix";

/// The LLM gateway. Cheap to clone; holds the active provider.
#[derive(Clone)]
pub struct LlmGateway {
    settings: LlmSettings,
    provider: Arc<dyn LlmProvider>,
}

impl LlmGateway {
    /// Build the gateway for the configured provider.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::NonRetryable`] when the provider name is not
    /// supported. One logical provider is active at a time.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        if settings.provider != "gemini" {
            return Err(LlmError::NonRetryable(format!(
                "unsupported provider: {}",
                settings.provider
            )));
        }
        let provider = Arc::new(GeminiProvider::new(settings.gemini_api_key.clone()));
        Ok(Self {
            settings: settings.clone(),
            provider,
        })
    }

    /// Build the gateway with an injected provider (tests, future providers).
    pub fn with_provider(settings: &LlmSettings, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            settings: settings.clone(),
            provider,
        }
    }

    fn build_request(&self, trace_id: &str, purpose: &str, name: &str, version: &str) -> LlmRequest {
        let mut max_output_tokens = self.settings.max_output_tokens;
        if purpose == PARSE_MATRIX_PURPOSE {
            max_output_tokens = max_output_tokens.max(8192);
        }
        LlmRequest {
            trace_id: trace_id.to_string(),
            purpose: purpose.to_string(),
            prompt_name: name.to_string(),
            prompt_version: version.to_string(),
            provider: self.settings.provider.clone(),
            model: self.settings.gemini_model.clone(),
            temperature: self.settings.temperature,
            max_output_tokens,
            timeout: Duration::from_secs(self.settings.timeout_seconds),
            response_mime_type: Some("application/json".to_string()),
        }
    }

    /// Render the template and run the provider retry loop.
    ///
    /// Retryable failures back off exponentially, bounded at 2 seconds;
    /// after the final retry the last retryable error surfaces. A
    /// non-retryable failure surfaces immediately.
    async fn generate(
        &self,
        trace_id: &str,
        purpose: &str,
        prompt_name: &str,
        prompt_version: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<LlmResponse, LlmError> {
        let template = prompts::get_prompt(prompt_name, prompt_version)?;

        let mut safe_vars = variables.clone();
        safe_vars
            .entry(REPAIR_INSTRUCTIONS_KEY.to_string())
            .or_default();
        let rendered = prompts::render(template.template, &safe_vars);

        let request = self.build_request(trace_id, purpose, prompt_name, prompt_version);

        let started = Instant::now();
        let mut retries: u32 = 0;
        let mut last_err: Option<LlmError> = None;

        for attempt in 0..=self.settings.max_retries {
            match self.provider.generate(&request, &rendered).await {
                Ok(output) => {
                    return Ok(LlmResponse {
                        trace_id: trace_id.to_string(),
                        provider: request.provider.clone(),
                        model: request.model.clone(),
                        output_text: output.text,
                        latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                        retries,
                        input_tokens: output.input_tokens,
                        output_tokens: output.output_tokens,
                    });
                }
                Err(LlmError::Retryable(message)) => {
                    retries = retries.saturating_add(1);
                    last_err = Some(LlmError::Retryable(message));
                    if attempt >= self.settings.max_retries {
                        break;
                    }
                    let backoff = (0.25 * 2f64.powi(i32::try_from(attempt).unwrap_or(i32::MAX)))
                        .min(2.0);
                    tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                }
                Err(err @ LlmError::NonRetryable(_)) => return Err(err),
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::Retryable("llm failed after retries".to_string())))
    }

    /// Render, call, and bind the response to `T`.
    ///
    /// On JSON parse or schema bind failure, reissues the call once with the
    /// stock repair instructions; a second failure is non-retryable. Exactly
    /// one telemetry record is emitted per invocation, at the terminal
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns the classified [`LlmError`] of the last attempt.
    pub async fn generate_structured<T: DeserializeOwned>(
        &self,
        purpose: &str,
        prompt_name: &str,
        prompt_version: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<T, LlmError> {
        let trace_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let outcome = self
            .structured_inner::<T>(&trace_id, purpose, prompt_name, prompt_version, variables)
            .await;

        let (retries, error_type) = match &outcome {
            Ok((_, retries)) => (*retries, None),
            Err((err, retries)) => (*retries, Some(err.error_type())),
        };
        record_llm_call(&LlmCallRecord {
            trace_id: &trace_id,
            provider: &self.settings.provider,
            model: &self.settings.gemini_model,
            purpose,
            prompt_name,
            prompt_version,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            retries,
            ok: outcome.is_ok(),
            error_type,
        });

        match outcome {
            Ok((value, _)) => Ok(value),
            Err((err, _)) => Err(err),
        }
    }

    async fn structured_inner<T: DeserializeOwned>(
        &self,
        trace_id: &str,
        purpose: &str,
        prompt_name: &str,
        prompt_version: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<(T, u32), (LlmError, u32)> {
        let response = self
            .generate(trace_id, purpose, prompt_name, prompt_version, variables)
            .await
            .map_err(|e| (e, 0))?;

        match serde_json::from_str::<T>(&response.output_text) {
            Ok(value) => Ok((value, response.retries)),
            Err(first_err) => {
                let mut repaired_vars = variables.clone();
                repaired_vars.insert(
                    REPAIR_INSTRUCTIONS_KEY.to_string(),
                    REPAIR_INSTRUCTIONS.to_string(),
                );

                let response2 = self
                    .generate(trace_id, purpose, prompt_name, prompt_version, &repaired_vars)
                    .await
                    .map_err(|e| (e, 0))?;

                match serde_json::from_str::<T>(&response2.output_text) {
                    Ok(value) => Ok((value, response2.retries)),
                    Err(second_err) => Err((
                        LlmError::NonRetryable(format!(
                            "structured validation failed after repair: {second_err} \
                             (first failure: {first_err})"
                        )),
                        response2.retries,
                    )),
                }
            }
        }
    }

    /// Plain-text invocation for health checks; emits one telemetry record.
    ///
    /// # Errors
    ///
    /// Returns the classified [`LlmError`] of the last attempt.
    pub async fn generate_text(
        &self,
        purpose: &str,
        prompt_name: &str,
        prompt_version: &str,
        variables: &BTreeMap<String, String>,
    ) -> Result<LlmResponse, LlmError> {
        let trace_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let outcome = self
            .generate(&trace_id, purpose, prompt_name, prompt_version, variables)
            .await;

        record_llm_call(&LlmCallRecord {
            trace_id: &trace_id,
            provider: &self.settings.provider,
            model: &self.settings.gemini_model,
            purpose,
            prompt_name,
            prompt_version,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            retries: outcome.as_ref().map(|r| r.retries).unwrap_or(0),
            ok: outcome.is_ok(),
            error_type: outcome.as_ref().err().map(|e| e.error_type()),
        });

        outcome
    }
}
