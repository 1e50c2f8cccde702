//! Cell-generation persistence.
//!
//! The unique key `(cell_id, prompt_name, prompt_version)` is the
//! idempotency token for the generate phase; concurrent upserts for the
//! same key are safe under replace semantics.

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::models::CellGeneration;

/// Fields for a generation outcome row.
#[derive(Debug)]
pub struct NewCellGeneration<'a> {
    pub guide_id: &'a str,
    pub cell_id: &'a str,
    pub prompt_name: &'a str,
    pub prompt_version: &'a str,
    pub status: &'a str,
    pub content_json: Option<&'a serde_json::Value>,
    pub model: Option<&'a str>,
    pub trace_id: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

/// Fetch the generation row for one cell under one prompt identity.
pub async fn get_cell_generation(
    conn: &mut SqliteConnection,
    cell_id: &str,
    prompt_name: &str,
    prompt_version: &str,
) -> Result<Option<CellGeneration>, sqlx::Error> {
    sqlx::query_as::<_, CellGeneration>(
        "SELECT * FROM cell_generations \
         WHERE cell_id = ?1 AND prompt_name = ?2 AND prompt_version = ?3",
    )
    .bind(cell_id)
    .bind(prompt_name)
    .bind(prompt_version)
    .fetch_optional(conn)
    .await
}

/// Insert or replace the generation outcome for a cell.
pub async fn upsert_cell_generation(
    conn: &mut SqliteConnection,
    new: NewCellGeneration<'_>,
) -> Result<CellGeneration, sqlx::Error> {
    sqlx::query_as::<_, CellGeneration>(
        "INSERT INTO cell_generations \
           (id, guide_id, cell_id, prompt_name, prompt_version, status, \
            content_json, model, trace_id, error_message) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         ON CONFLICT(cell_id, prompt_name, prompt_version) DO UPDATE SET \
             status = excluded.status, \
             content_json = excluded.content_json, \
             model = excluded.model, \
             trace_id = excluded.trace_id, \
             error_message = excluded.error_message \
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(new.guide_id)
    .bind(new.cell_id)
    .bind(new.prompt_name)
    .bind(new.prompt_version)
    .bind(new.status)
    .bind(new.content_json.map(|v| v.to_string()))
    .bind(new.model)
    .bind(new.trace_id)
    .bind(new.error_message)
    .fetch_one(conn)
    .await
}

/// Count of SUCCESS rows for a guide under one prompt identity.
pub async fn count_success_for_guide(
    conn: &mut SqliteConnection,
    guide_id: &str,
    prompt_name: &str,
    prompt_version: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM cell_generations \
         WHERE guide_id = ?1 AND prompt_name = ?2 AND prompt_version = ?3 \
           AND status = 'SUCCESS'",
    )
    .bind(guide_id)
    .bind(prompt_name)
    .bind(prompt_version)
    .fetch_one(conn)
    .await
}

/// Count of all outcome rows (SUCCESS or FAILED) for progress checks.
pub async fn count_total_for_guide(
    conn: &mut SqliteConnection,
    guide_id: &str,
    prompt_name: &str,
    prompt_version: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM cell_generations \
         WHERE guide_id = ?1 AND prompt_name = ?2 AND prompt_version = ?3",
    )
    .bind(guide_id)
    .bind(prompt_name)
    .bind(prompt_version)
    .fetch_one(conn)
    .await
}

/// All generation rows for a guide under one prompt identity.
pub async fn list_for_guide(
    conn: &mut SqliteConnection,
    guide_id: &str,
    prompt_name: &str,
    prompt_version: &str,
) -> Result<Vec<CellGeneration>, sqlx::Error> {
    sqlx::query_as::<_, CellGeneration>(
        "SELECT * FROM cell_generations \
         WHERE guide_id = ?1 AND prompt_name = ?2 AND prompt_version = ?3",
    )
    .bind(guide_id)
    .bind(prompt_name)
    .bind(prompt_version)
    .fetch_all(conn)
    .await
}
