//! Domain error type shared across services, repos, and task handlers.
//!
//! An [`AppError`] is a *terminal* domain failure: the task runner records it
//! as a structured failure and does not retry. Infrastructure failures
//! (database, transport) travel as their own error types inside `anyhow`
//! and re-raise through the runner's retry mechanism.

use serde::Serialize;
use thiserror::Error;

/// Stable machine-readable error codes surfaced in task results and API
/// responses. The string encodings never change across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    /// Input rejected at a boundary (bad MIME type, role-title length, URL scheme).
    ValidationError,
    /// Guide or artifact missing.
    NotFound,
    /// Missing extractor backend or credentials.
    ConfigError,
    /// Upload, download, or signed-URL failure.
    StorageError,
    /// Transient LLM failure that exhausted its retry budget.
    LlmRetryable,
    /// LLM failure that must not be retried (auth, schema bind, bad request).
    LlmNonRetryable,
    /// Catch-all for uncaught failures.
    InternalError,
}

impl ErrorCode {
    /// The stable string encoding used in logs and API payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::ConfigError => "CONFIG_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::LlmRetryable => "LLM_RETRYABLE",
            Self::LlmNonRetryable => "LLM_NON_RETRYABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain error carrying a stable code and a human-readable reason.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct AppError {
    /// Stable error code.
    pub code: ErrorCode,
    /// Human-readable reason; may be surfaced on the guide row.
    pub message: String,
}

impl AppError {
    /// Build an error with an explicit code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Boundary validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Missing guide, artifact, or other resource.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Missing backend or credentials.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigError, message)
    }

    /// Object-store failure that is not worth retrying.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, message)
    }

    /// Non-retryable LLM failure.
    pub fn llm_non_retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::LlmNonRetryable, message)
    }

    /// Catch-all internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}
