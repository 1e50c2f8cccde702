//! Row types mapped with `sqlx::FromRow`.
//!
//! Foreign keys are stored as plain TEXT ids; navigation happens through
//! repository queries, never through back-references.

use sqlx::FromRow;

/// A company owning zero or more guides.
#[derive(Debug, Clone, FromRow)]
pub struct Company {
    pub id: String,
    pub website_url: String,
    pub name: Option<String>,
    pub context: Option<String>,
    pub created_at: String,
}

/// A leveling guide moving through the pipeline.
///
/// `status` holds a [`crate::status::GuideStatus`] string; `pdf_path` is set
/// at creation and never mutated.
#[derive(Debug, Clone, FromRow)]
pub struct Guide {
    pub id: String,
    pub company_id: String,
    pub role_title: Option<String>,
    pub status: String,
    pub pdf_path: String,
    pub original_filename: Option<String>,
    pub mime_type: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Persisted intermediate output. `kind` is `PDF_TEXT` (storage pointer +
/// quality metadata) or `MATRIX_JSON` (full parsed matrix); each kind has at
/// most one current row per guide (latest wins).
#[derive(Debug, Clone, FromRow)]
pub struct GuideArtifact {
    pub id: String,
    pub guide_id: String,
    pub kind: String,
    pub content_json: Option<String>,
    pub created_at: String,
}

/// Append-only audit row for one parsing attempt.
#[derive(Debug, Clone, FromRow)]
pub struct ParseRun {
    pub id: String,
    pub guide_id: String,
    pub strategy: String,
    pub status: String,
    pub confidence: Option<f64>,
    pub model: Option<String>,
    pub prompt_version: Option<String>,
    pub input_artifact_id: Option<String>,
    pub output_artifact_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// A matrix column, upserted by `(guide_id, code)`.
#[derive(Debug, Clone, FromRow)]
pub struct Level {
    pub id: String,
    pub guide_id: String,
    pub code: String,
    pub title: Option<String>,
    pub position: i64,
}

/// A matrix row, upserted by `(guide_id, name)`.
#[derive(Debug, Clone, FromRow)]
pub struct Competency {
    pub id: String,
    pub guide_id: String,
    pub name: String,
    pub position: i64,
}

/// One (competency, level) pair with its definition text.
#[derive(Debug, Clone, FromRow)]
pub struct GuideCell {
    pub id: String,
    pub guide_id: String,
    pub competency_id: String,
    pub level_id: String,
    pub definition_text: Option<String>,
    pub source_artifact_id: Option<String>,
}

/// Terminal generation outcome for one cell under one prompt identity.
///
/// The unique key `(cell_id, prompt_name, prompt_version)` is the
/// idempotency token for the generate phase; re-runs replace via upsert.
#[derive(Debug, Clone, FromRow)]
pub struct CellGeneration {
    pub id: String,
    pub guide_id: String,
    pub cell_id: String,
    pub prompt_name: String,
    pub prompt_version: String,
    pub status: String,
    pub content_json: Option<String>,
    pub model: Option<String>,
    pub trace_id: Option<String>,
    pub error_message: Option<String>,
    pub created_at: String,
}

/// A queued task delivery.
#[derive(Debug, Clone, FromRow)]
pub struct QueuedTask {
    pub id: String,
    pub name: String,
    pub queue: String,
    pub args_json: String,
    pub status: String,
    pub attempts: i64,
    pub run_at: String,
    pub locked_at: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
}
