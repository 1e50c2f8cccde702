//! Boundary validations for guide uploads.
//!
//! These reject bad input before anything enters the pipeline; failures
//! surface as `VALIDATION_ERROR` and never create a guide row.

use url::Url;

use crate::errors::AppError;

/// Maximum accepted PDF size.
pub const MAX_PDF_BYTES: usize = 20 * 1024 * 1024;

/// Role title must be present and reasonably sized.
pub fn validate_role_title(role_title: &str) -> Result<(), AppError> {
    let trimmed = role_title.trim();
    if trimmed.len() < 2 {
        return Err(AppError::validation("role_title must be at least 2 characters"));
    }
    if trimmed.len() > 200 {
        return Err(AppError::validation("role_title must be at most 200 characters"));
    }
    Ok(())
}

/// Parse and normalize a company website URL.
///
/// A bare host is accepted and upgraded to `https`; anything that is not
/// http(s) is rejected. The host is lowercased so company upserts key on a
/// canonical value.
pub fn normalize_website_url(website_url: &str) -> Result<String, AppError> {
    let trimmed = website_url.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("website_url is required"));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let parsed = Url::parse(&candidate)
        .map_err(|e| AppError::validation(format!("invalid website_url: {e}")))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AppError::validation(format!(
            "website_url must use http or https, got {}",
            parsed.scheme()
        )));
    }
    if parsed.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(AppError::validation("website_url must include a host"));
    }

    Ok(parsed.to_string())
}

/// Validate an uploaded PDF payload.
pub fn validate_pdf_upload(
    filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> Result<(), AppError> {
    if bytes.is_empty() {
        return Err(AppError::validation("uploaded PDF is empty"));
    }
    if bytes.len() > MAX_PDF_BYTES {
        return Err(AppError::validation(format!(
            "uploaded PDF exceeds {MAX_PDF_BYTES} bytes"
        )));
    }

    let is_pdf_mime = content_type.eq_ignore_ascii_case("application/pdf");
    let is_octet_with_pdf_name = content_type.eq_ignore_ascii_case("application/octet-stream")
        && filename.to_lowercase().ends_with(".pdf");
    if !is_pdf_mime && !is_octet_with_pdf_name {
        return Err(AppError::validation(format!(
            "expected a PDF upload, got content type {content_type}"
        )));
    }

    if !bytes.starts_with(b"%PDF") {
        return Err(AppError::validation("file does not look like a PDF"));
    }
    Ok(())
}
