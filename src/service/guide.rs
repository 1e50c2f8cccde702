//! Guide lifecycle: upload ingestion, status reads, and the extract and
//! parse phase executors.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::llm::LlmError;
use crate::pdf::{score_extraction, PdfError};
use crate::repos::{company, guide as guide_repo, matrix};
use crate::schemas::{GuideCreateResponse, ParsedMatrix, StatusResponse};
use crate::status::GuideStatus;
use crate::storage::{self, StorageError};
use crate::validations;

use super::PipelineContext;

/// Signed-URL lifetime for PDF downloads.
const SIGNED_URL_TTL_SECONDS: u64 = 3600;

/// Artifact kinds.
pub const ARTIFACT_PDF_TEXT: &str = "PDF_TEXT";
pub const ARTIFACT_MATRIX_JSON: &str = "MATRIX_JSON";

const PARSE_STRATEGY: &str = "PARSE_MATRIX_LLM_V1";
const BAD_PDF_MESSAGE: &str = "PDF looks scanned/empty (no embedded text)";

/// An uploaded guide PDF plus its form fields.
#[derive(Debug)]
pub struct GuideUpload {
    pub website_url: String,
    pub role_title: String,
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub company_name: Option<String>,
    pub company_context: Option<String>,
}

/// Outcome of one extract-executor run.
#[derive(Debug, Clone, Serialize)]
pub enum ExtractOutcome {
    /// This worker performed the extraction.
    Completed {
        status: GuideStatus,
        confidence: f64,
    },
    /// Another worker holds or already finished this phase.
    Skipped { status: GuideStatus },
}

/// Map a storage failure for in-task use: transient failures stay
/// infrastructure errors (the runner retries), the rest become terminal
/// domain errors.
fn storage_failure(err: StorageError) -> anyhow::Error {
    if err.is_retryable() {
        anyhow::Error::new(err)
    } else {
        AppError::storage(err.to_string()).into()
    }
}

/// Map a gateway failure: retryable errors re-raise through the runner,
/// non-retryable ones are terminal domain errors.
fn llm_failure(err: LlmError) -> anyhow::Error {
    match err {
        LlmError::Retryable(_) => anyhow::Error::new(err),
        LlmError::NonRetryable(message) => AppError::llm_non_retryable(message).into(),
    }
}

// ---------------------------------------------------------------------------
// Ingress operations
// ---------------------------------------------------------------------------

/// Create a guide from an upload: validate, upsert the company, store the
/// PDF, insert the QUEUED row, and enqueue extraction.
///
/// Re-uploading the same PDF creates a second guide; artifacts are never
/// shared between guides.
pub async fn create_guide_from_upload(
    ctx: &PipelineContext,
    upload: GuideUpload,
) -> anyhow::Result<GuideCreateResponse> {
    validations::validate_role_title(&upload.role_title)?;
    let website_url = validations::normalize_website_url(&upload.website_url)?;
    validations::validate_pdf_upload(&upload.filename, &upload.content_type, &upload.bytes)?;

    let company = {
        let mut conn = ctx.pool.acquire().await?;
        company::upsert_by_website(
            &mut *conn,
            &website_url,
            upload.company_name.as_deref(),
            upload.company_context.as_deref(),
        )
        .await?
    };

    let folder = Uuid::new_v4();
    let pdf_path = storage::pdf_object_path(&company.id, &folder, &upload.filename);
    ctx.storage
        .upload(&pdf_path, upload.bytes, &upload.content_type)
        .await
        .map_err(|e| AppError::storage(e.to_string()))?;

    let guide = {
        let mut conn = ctx.pool.acquire().await?;
        guide_repo::create(
            &mut *conn,
            guide_repo::NewGuide {
                company_id: &company.id,
                role_title: Some(upload.role_title.trim()),
                status: GuideStatus::Queued,
                pdf_path: &pdf_path,
                original_filename: Some(&upload.filename),
                mime_type: Some(&upload.content_type),
            },
        )
        .await?
    };

    ctx.queue
        .enqueue(
            "extract_text",
            &serde_json::json!({ "guide_id": guide.id }),
            None,
        )
        .await?;
    info!(guide_id = %guide.id, role_title = %upload.role_title, website_url = %website_url, "guide enqueued for extraction");

    Ok(GuideCreateResponse {
        status_url: format!("/api/guides/{}/status", guide.id),
        results_url: format!("/api/guides/{}/results", guide.id),
        pdf_url: format!("/api/guides/{}/pdf", guide.id),
        guide_id: guide.id,
        company_id: company.id,
        status: guide.status,
        created_at: guide.created_at,
    })
}

/// The status-poll contract.
pub async fn get_status(ctx: &PipelineContext, guide_id: &str) -> anyhow::Result<StatusResponse> {
    let mut conn = ctx.pool.acquire().await?;
    let guide = guide_repo::get(&mut *conn, guide_id)
        .await?
        .ok_or_else(|| AppError::not_found("Guide not found"))?;
    Ok(StatusResponse {
        guide_id: guide.id,
        status: guide.status,
        created_at: guide.created_at,
        updated_at: guide.updated_at,
    })
}

/// Signed download URL for the original PDF.
pub async fn get_signed_pdf_url(ctx: &PipelineContext, guide_id: &str) -> anyhow::Result<String> {
    let mut conn = ctx.pool.acquire().await?;
    let guide = guide_repo::get(&mut *conn, guide_id)
        .await?
        .ok_or_else(|| AppError::not_found("PDF not available for this guide yet"))?;
    drop(conn);

    let url = ctx
        .storage
        .create_signed_url(&guide.pdf_path, SIGNED_URL_TTL_SECONDS)
        .await
        .map_err(|e| AppError::storage(e.to_string()))?;
    Ok(url)
}

// ---------------------------------------------------------------------------
// Extract executor
// ---------------------------------------------------------------------------

/// Extract phase: `QUEUED -> EXTRACTING_TEXT -> TEXT_EXTRACTED | FAILED_BAD_PDF`.
///
/// Claims first; when the claim fails the executor returns idempotently
/// with the current status and touches nothing.
pub async fn extract_pdf_text(
    ctx: &PipelineContext,
    guide_id: &str,
) -> anyhow::Result<ExtractOutcome> {
    let guide = {
        let mut conn = ctx.pool.acquire().await?;
        let guide = guide_repo::get(&mut *conn, guide_id)
            .await?
            .ok_or_else(|| AppError::not_found("Guide not found"))?;

        let claimed = guide_repo::claim_status(
            &mut *conn,
            guide_id,
            GuideStatus::Queued,
            GuideStatus::ExtractingText,
        )
        .await?;
        if !claimed {
            let latest = guide_repo::get(&mut *conn, guide_id)
                .await?
                .ok_or_else(|| AppError::not_found("Guide not found"))?;
            let status = GuideStatus::parse(&latest.status)?;
            info!(guide_id, %status, "extract claim lost, returning idempotently");
            return Ok(ExtractOutcome::Skipped { status });
        }
        guide
    };

    // Compute outside any transaction: storage fetch and engine run.
    let pdf_bytes = ctx
        .storage
        .download_bytes(&guide.pdf_path)
        .await
        .map_err(storage_failure)?;

    let extracted = match ctx.extractor.extract(&pdf_bytes) {
        Ok(extracted) => extracted,
        Err(err @ (PdfError::Empty | PdfError::Unreadable(_))) => {
            let message = format!("PDF could not be read: {err}");
            let mut tx = ctx.pool.begin().await?;
            guide_repo::create_parse_run(
                &mut *tx,
                guide_repo::NewParseRun {
                    guide_id,
                    strategy: "EXTRACT_FAILED",
                    status: "FAILED",
                    confidence: Some(0.0),
                    model: None,
                    prompt_version: Some("v1"),
                    input_artifact_id: None,
                    output_artifact_id: None,
                    error_message: Some(&message),
                },
            )
            .await?;
            guide_repo::update_status(&mut *tx, guide_id, GuideStatus::FailedBadPdf, Some(&message))
                .await?;
            tx.commit().await?;
            warn!(guide_id, %err, "extraction failed, guide marked bad PDF");
            return Ok(ExtractOutcome::Completed {
                status: GuideStatus::FailedBadPdf,
                confidence: 0.0,
            });
        }
    };

    let quality = score_extraction(&extracted.text, extracted.page_count, extracted.pages_with_text);

    // Persist the text blob next to the PDF before touching the database.
    let text_path = storage::text_object_path(&guide.pdf_path);
    ctx.storage
        .upload(&text_path, extracted.text.clone().into_bytes(), "text/plain")
        .await
        .map_err(storage_failure)?;

    let strategy = format!("EXTRACT_{}", extracted.strategy.to_uppercase().replace('-', "_"));
    let (run_status, next_status, error_message) =
        if quality.is_scanned_likely || quality.confidence < 0.20 {
            ("FAILED", GuideStatus::FailedBadPdf, Some(BAD_PDF_MESSAGE))
        } else {
            ("SUCCESS", GuideStatus::TextExtracted, None)
        };

    let content = serde_json::json!({
        "path": text_path,
        "strategy": extracted.strategy,
        "page_count": extracted.page_count,
        "pages_with_text": extracted.pages_with_text,
        "confidence": quality.confidence,
        "char_count": quality.char_count,
        "word_count": quality.word_count,
        "line_count": quality.line_count,
        "printable_ratio": quality.printable_ratio,
        "flags": {
            "is_scanned_likely": quality.is_scanned_likely,
            "is_garbled_likely": quality.is_garbled_likely,
            "has_matrix_signals": quality.has_matrix_signals,
            "has_table_signals": quality.has_table_signals,
        },
        "notes": quality.notes,
    });

    let mut tx = ctx.pool.begin().await?;
    let artifact = guide_repo::upsert_artifact(&mut *tx, guide_id, ARTIFACT_PDF_TEXT, &content).await?;
    guide_repo::create_parse_run(
        &mut *tx,
        guide_repo::NewParseRun {
            guide_id,
            strategy: &strategy,
            status: run_status,
            confidence: Some(quality.confidence),
            model: None,
            prompt_version: Some("v1"),
            input_artifact_id: None,
            output_artifact_id: Some(&artifact.id),
            error_message,
        },
    )
    .await?;
    guide_repo::update_status(&mut *tx, guide_id, next_status, error_message).await?;
    tx.commit().await?;

    info!(
        guide_id,
        status = %next_status,
        confidence = quality.confidence,
        strategy = extracted.strategy,
        "extraction complete"
    );
    Ok(ExtractOutcome::Completed {
        status: next_status,
        confidence: quality.confidence,
    })
}

// ---------------------------------------------------------------------------
// Parse executor
// ---------------------------------------------------------------------------

/// Reduce JSON-breaking weirdness before the text goes into a prompt.
fn sanitize_for_llm(text: &str) -> String {
    text.replace('\u{0000}', "")
        .replace("\r\n", "\n")
        .replace('"', "'")
}

/// Record a failed parse run and move the guide to FAILED_PARSE in its own
/// small transaction. Best-effort: a failure here is logged, not raised, so
/// the original error keeps propagating.
async fn record_parse_failure(
    ctx: &PipelineContext,
    guide_id: &str,
    input_artifact_id: Option<&str>,
    confidence: f64,
    message: &str,
) {
    let result: anyhow::Result<()> = async {
        let mut tx = ctx.pool.begin().await?;
        guide_repo::create_parse_run(
            &mut *tx,
            guide_repo::NewParseRun {
                guide_id,
                strategy: PARSE_STRATEGY,
                status: "FAILED",
                confidence: Some(confidence),
                model: Some(&ctx.settings.llm.gemini_model),
                prompt_version: Some("v1"),
                input_artifact_id,
                output_artifact_id: None,
                error_message: Some(message),
            },
        )
        .await?;
        guide_repo::update_status(&mut *tx, guide_id, GuideStatus::FailedParse, Some(message))
            .await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    if let Err(err) = result {
        error!(guide_id, error = %err, "failed to record parse failure");
    }
}

/// Read the stored MATRIX_JSON artifact, if any.
async fn stored_matrix(
    ctx: &PipelineContext,
    guide_id: &str,
) -> anyhow::Result<Option<ParsedMatrix>> {
    let mut conn = ctx.pool.acquire().await?;
    let artifact = guide_repo::get_artifact(&mut *conn, guide_id, ARTIFACT_MATRIX_JSON).await?;
    match artifact.and_then(|a| a.content_json) {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Parse phase: `TEXT_EXTRACTED -> PARSING_MATRIX -> MATRIX_PARSED | FAILED_PARSE`.
///
/// Staged: claim (short transaction) → fetch input (no transaction) → LLM
/// compute (no transaction) → persist atomically. Any failure after the LLM
/// call is recorded as a FAILED parse run before the error propagates.
pub async fn parse_matrix(ctx: &PipelineContext, guide_id: &str) -> anyhow::Result<ParsedMatrix> {
    let prompt_version = "v1";

    // ---------- Step 1: claim ----------
    {
        let mut conn = ctx.pool.acquire().await?;
        let guide = guide_repo::get(&mut *conn, guide_id)
            .await?
            .ok_or_else(|| AppError::not_found("Guide not found"))?;
        let status = GuideStatus::parse(&guide.status)?;

        if status == GuideStatus::MatrixParsed {
            if let Some(parsed) = stored_matrix(ctx, guide_id).await? {
                return Ok(parsed);
            }
        }
        if status == GuideStatus::FailedBadPdf {
            return Err(
                AppError::validation("Guide is marked as bad PDF; cannot parse matrix").into(),
            );
        }

        let claimed = guide_repo::claim_status(
            &mut *conn,
            guide_id,
            GuideStatus::TextExtracted,
            GuideStatus::ParsingMatrix,
        )
        .await?;
        if !claimed {
            let latest = guide_repo::get(&mut *conn, guide_id)
                .await?
                .ok_or_else(|| AppError::not_found("Guide not found"))?;
            if latest.status == GuideStatus::MatrixParsed.as_str() {
                if let Some(parsed) = stored_matrix(ctx, guide_id).await? {
                    return Ok(parsed);
                }
            }
            return Err(AppError::validation(format!(
                "Guide not in TEXT_EXTRACTED state (current={})",
                latest.status
            ))
            .into());
        }
    }

    // ---------- Step 2: fetch input ----------
    let text_artifact = {
        let mut conn = ctx.pool.acquire().await?;
        guide_repo::get_artifact(&mut *conn, guide_id, ARTIFACT_PDF_TEXT)
            .await?
            .ok_or_else(|| AppError::not_found("Missing PDF_TEXT artifact; run extraction first"))?
    };
    let content: serde_json::Value = text_artifact
        .content_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?
        .ok_or_else(|| AppError::not_found("PDF_TEXT artifact has no content"))?;
    let text_path = content
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::not_found("PDF_TEXT artifact has no storage pointer"))?;

    let raw = ctx
        .storage
        .download_bytes(text_path)
        .await
        .map_err(storage_failure)?;
    let text = sanitize_for_llm(&String::from_utf8_lossy(&raw));

    // ---------- Step 3: LLM compute ----------
    let mut variables = BTreeMap::new();
    variables.insert("text".to_string(), text);

    let parsed = match ctx
        .llm
        .generate_structured::<ParsedMatrix>("parse_matrix", "parse_matrix", prompt_version, &variables)
        .await
    {
        Ok(parsed) => parsed,
        Err(err) => {
            record_parse_failure(ctx, guide_id, Some(&text_artifact.id), 0.0, &err.to_string())
                .await;
            return Err(llm_failure(err));
        }
    };

    // ---------- Step 4: persist atomically ----------
    let persisted: anyhow::Result<()> = async {
        let mut tx = ctx.pool.begin().await?;

        let matrix_artifact = guide_repo::upsert_artifact(
            &mut *tx,
            guide_id,
            ARTIFACT_MATRIX_JSON,
            &serde_json::to_value(&parsed)?,
        )
        .await?;

        let mut level_ids: BTreeMap<&str, String> = BTreeMap::new();
        for (i, code) in parsed.levels.iter().enumerate() {
            let level = matrix::upsert_level(&mut *tx, guide_id, code, i64::try_from(i).unwrap_or(0))
                .await?;
            level_ids.insert(code.as_str(), level.id);
        }

        let mut comp_ids: BTreeMap<&str, String> = BTreeMap::new();
        for (i, comp) in parsed.competencies.iter().enumerate() {
            let row = matrix::upsert_competency(
                &mut *tx,
                guide_id,
                &comp.name,
                i64::try_from(i).unwrap_or(0),
            )
            .await?;
            comp_ids.insert(comp.name.as_str(), row.id);
        }

        for comp in &parsed.competencies {
            let Some(comp_id) = comp_ids.get(comp.name.as_str()) else {
                continue;
            };
            for (level_code, cell_text) in &comp.cells {
                let Some(level_id) = level_ids.get(level_code.as_str()) else {
                    continue;
                };
                matrix::upsert_cell(
                    &mut *tx,
                    guide_id,
                    comp_id,
                    level_id,
                    cell_text.trim(),
                    Some(&text_artifact.id),
                )
                .await?;
            }
        }

        guide_repo::create_parse_run(
            &mut *tx,
            guide_repo::NewParseRun {
                guide_id,
                strategy: PARSE_STRATEGY,
                status: "SUCCESS",
                confidence: Some(parsed.confidence),
                model: Some(&ctx.settings.llm.gemini_model),
                prompt_version: Some(prompt_version),
                input_artifact_id: Some(&text_artifact.id),
                output_artifact_id: Some(&matrix_artifact.id),
                error_message: None,
            },
        )
        .await?;

        guide_repo::update_status(&mut *tx, guide_id, GuideStatus::MatrixParsed, None).await?;
        tx.commit().await?;
        Ok(())
    }
    .await;

    match persisted {
        Ok(()) => {
            info!(
                guide_id,
                levels = parsed.levels.len(),
                competencies = parsed.competencies.len(),
                confidence = parsed.confidence,
                "matrix parsed"
            );
            Ok(parsed)
        }
        Err(err) => {
            record_parse_failure(
                ctx,
                guide_id,
                Some(&text_artifact.id),
                parsed.confidence,
                &format!("Persist failed: {err}"),
            )
            .await;
            Err(err)
        }
    }
}
