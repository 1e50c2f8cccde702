//! Private object storage behind the [`StorageClient`] trait.
//!
//! The production implementation targets the Supabase storage REST API;
//! tests substitute an in-memory client. Path convention:
//! `companies/{company_id}/guides/{uuid}/{filename}` for PDFs, with the
//! extracted text stored as `extracted.txt` alongside the PDF.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::config::StorageSettings;

/// Errors returned by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// HTTP transport failure (connect, timeout, body read).
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success status from the storage API.
    #[error("storage returned status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },
    /// Storage is not configured (missing URL, key, or bucket).
    #[error("storage misconfigured: {0}")]
    Config(String),
    /// The signed-URL response did not match the expected shape.
    #[error("storage response parse error: {0}")]
    Parse(String),
}

impl StorageError {
    /// Whether the task runner should retry after this failure.
    ///
    /// Transport failures and 429/5xx are transient; 4xx and configuration
    /// problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Config(_) | Self::Parse(_) => false,
        }
    }
}

/// Object path for an uploaded guide PDF.
pub fn pdf_object_path(company_id: &str, folder: &Uuid, filename: &str) -> String {
    format!("companies/{company_id}/guides/{folder}/{filename}")
}

/// Object path for the extracted text, next to the PDF.
///
/// Correct even when the folder UUID differs from the guide id.
pub fn text_object_path(pdf_path: &str) -> String {
    match pdf_path.rsplit_once('/') {
        Some((base, _)) => format!("{base}/extracted.txt"),
        None => "extracted.txt".to_string(),
    }
}

/// Object store operations used by the pipeline.
#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Upload `bytes` at `path` with upsert semantics.
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Create a time-limited signed download URL for `path`.
    async fn create_signed_url(&self, path: &str, ttl_seconds: u64)
        -> Result<String, StorageError>;

    /// Download the object at `path`.
    async fn download_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError>;
}

// ---------------------------------------------------------------------------
// Supabase implementation
// ---------------------------------------------------------------------------

/// Supabase storage REST client for a single private bucket.
#[derive(Debug, Clone)]
pub struct SupabaseStorage {
    base_url: String,
    bucket: String,
    service_role_key: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

impl SupabaseStorage {
    /// Build a client from settings. Configuration is validated lazily at
    /// call time so read-only subcommands can construct the context without
    /// storage credentials.
    pub fn new(settings: &StorageSettings) -> Self {
        Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            bucket: settings.bucket.clone(),
            service_role_key: settings.service_role_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    fn ensure_configured(&self) -> Result<(), StorageError> {
        if self.base_url.is_empty() || self.bucket.is_empty() || self.service_role_key.is_empty() {
            return Err(StorageError::Config(
                "SUPABASE_URL, SUPABASE_SERVICE_ROLE_KEY, and SUPABASE_STORAGE_BUCKET must be set"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Check the response status and return the body, truncating error bodies
/// so storage failures stay loggable.
async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let collapsed: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
    const MAX_BODY_CHARS: usize = 256;
    let truncated: String = collapsed.chars().take(MAX_BODY_CHARS).collect();
    Err(StorageError::HttpStatus {
        status: status.as_u16(),
        body: truncated,
    })
}

#[async_trait]
impl StorageClient for SupabaseStorage {
    async fn upload(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.ensure_configured()?;
        let url = format!("{}/storage/v1/object/{}/{path}", self.base_url, self.bucket);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_role_key)
            .header("x-upsert", "true")
            .header("content-type", content_type)
            .body(bytes)
            .send()
            .await?;
        check_response(response).await?;
        Ok(())
    }

    async fn create_signed_url(
        &self,
        path: &str,
        ttl_seconds: u64,
    ) -> Result<String, StorageError> {
        self.ensure_configured()?;
        let url = format!(
            "{}/storage/v1/object/sign/{}/{path}",
            self.base_url, self.bucket
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_role_key)
            .json(&serde_json::json!({ "expiresIn": ttl_seconds }))
            .send()
            .await?;
        let response = check_response(response).await?;
        let parsed: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Parse(e.to_string()))?;
        Ok(format!("{}/storage/v1{}", self.base_url, parsed.signed_url))
    }

    async fn download_bytes(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let signed = self.create_signed_url(path, 300).await?;
        let response = self.client.get(&signed).send().await?;
        let response = check_response(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}
