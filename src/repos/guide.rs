//! Guide persistence: row lifecycle, the atomic status claim, artifacts,
//! and the append-only parse-run audit log.

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::models::{Guide, GuideArtifact, ParseRun};
use crate::status::GuideStatus;

/// Fields for a new guide row.
#[derive(Debug)]
pub struct NewGuide<'a> {
    pub company_id: &'a str,
    pub role_title: Option<&'a str>,
    pub status: GuideStatus,
    pub pdf_path: &'a str,
    pub original_filename: Option<&'a str>,
    pub mime_type: Option<&'a str>,
}

/// Fields for a parse-run audit row.
#[derive(Debug)]
pub struct NewParseRun<'a> {
    pub guide_id: &'a str,
    pub strategy: &'a str,
    pub status: &'a str,
    pub confidence: Option<f64>,
    pub model: Option<&'a str>,
    pub prompt_version: Option<&'a str>,
    pub input_artifact_id: Option<&'a str>,
    pub output_artifact_id: Option<&'a str>,
    pub error_message: Option<&'a str>,
}

/// Insert a guide row and return it.
pub async fn create(conn: &mut SqliteConnection, new: NewGuide<'_>) -> Result<Guide, sqlx::Error> {
    sqlx::query_as::<_, Guide>(
        "INSERT INTO guides (id, company_id, role_title, status, pdf_path, original_filename, mime_type) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(new.company_id)
    .bind(new.role_title)
    .bind(new.status.as_str())
    .bind(new.pdf_path)
    .bind(new.original_filename)
    .bind(new.mime_type)
    .fetch_one(conn)
    .await
}

/// Fetch a guide by id.
pub async fn get(conn: &mut SqliteConnection, guide_id: &str) -> Result<Option<Guide>, sqlx::Error> {
    sqlx::query_as::<_, Guide>("SELECT * FROM guides WHERE id = ?1")
        .bind(guide_id)
        .fetch_optional(conn)
        .await
}

/// Set the guide status unconditionally. `error_message` only overwrites
/// when provided.
pub async fn update_status(
    conn: &mut SqliteConnection,
    guide_id: &str,
    status: GuideStatus,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    match error_message {
        Some(message) => {
            sqlx::query(
                "UPDATE guides SET status = ?1, error_message = ?2, updated_at = datetime('now') \
                 WHERE id = ?3",
            )
            .bind(status.as_str())
            .bind(message)
            .bind(guide_id)
            .execute(conn)
            .await?;
        }
        None => {
            sqlx::query("UPDATE guides SET status = ?1, updated_at = datetime('now') WHERE id = ?2")
                .bind(status.as_str())
                .bind(guide_id)
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

/// Atomic compare-and-set on the status column.
///
/// A single conditional UPDATE — no read-then-write — so that under
/// at-least-once task delivery exactly one of N concurrent claimants wins.
/// Returns whether this caller took the transition.
pub async fn claim_status(
    conn: &mut SqliteConnection,
    guide_id: &str,
    from: GuideStatus,
    to: GuideStatus,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE guides SET status = ?1, updated_at = datetime('now') \
         WHERE id = ?2 AND status = ?3",
    )
    .bind(to.as_str())
    .bind(guide_id)
    .bind(from.as_str())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Create or replace the current artifact of `kind` for a guide.
///
/// Latest-wins: the newest row of each kind is updated in place, so
/// duplicate writes during a re-run simply overwrite with the same content.
pub async fn upsert_artifact(
    conn: &mut SqliteConnection,
    guide_id: &str,
    kind: &str,
    content_json: &serde_json::Value,
) -> Result<GuideArtifact, sqlx::Error> {
    let existing = get_artifact(&mut *conn, guide_id, kind).await?;
    if let Some(artifact) = existing {
        return sqlx::query_as::<_, GuideArtifact>(
            "UPDATE guide_artifacts SET content_json = ?1 WHERE id = ?2 RETURNING *",
        )
        .bind(content_json.to_string())
        .bind(&artifact.id)
        .fetch_one(conn)
        .await;
    }

    sqlx::query_as::<_, GuideArtifact>(
        "INSERT INTO guide_artifacts (id, guide_id, kind, content_json) \
         VALUES (?1, ?2, ?3, ?4) RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(guide_id)
    .bind(kind)
    .bind(content_json.to_string())
    .fetch_one(conn)
    .await
}

/// Fetch the current (newest) artifact of `kind` for a guide.
pub async fn get_artifact(
    conn: &mut SqliteConnection,
    guide_id: &str,
    kind: &str,
) -> Result<Option<GuideArtifact>, sqlx::Error> {
    sqlx::query_as::<_, GuideArtifact>(
        "SELECT * FROM guide_artifacts WHERE guide_id = ?1 AND kind = ?2 \
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(guide_id)
    .bind(kind)
    .fetch_optional(conn)
    .await
}

/// Append a parse-run audit row. Rows are never updated.
pub async fn create_parse_run(
    conn: &mut SqliteConnection,
    new: NewParseRun<'_>,
) -> Result<ParseRun, sqlx::Error> {
    sqlx::query_as::<_, ParseRun>(
        "INSERT INTO parse_runs \
           (id, guide_id, strategy, status, confidence, model, prompt_version, \
            input_artifact_id, output_artifact_id, error_message) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(new.guide_id)
    .bind(new.strategy)
    .bind(new.status)
    .bind(new.confidence)
    .bind(new.model)
    .bind(new.prompt_version)
    .bind(new.input_artifact_id)
    .bind(new.output_artifact_id)
    .bind(new.error_message)
    .fetch_one(conn)
    .await
}

/// List parse runs for a guide, newest last.
pub async fn list_parse_runs(
    conn: &mut SqliteConnection,
    guide_id: &str,
) -> Result<Vec<ParseRun>, sqlx::Error> {
    sqlx::query_as::<_, ParseRun>(
        "SELECT * FROM parse_runs WHERE guide_id = ?1 ORDER BY created_at, id",
    )
    .bind(guide_id)
    .fetch_all(conn)
    .await
}
