//! Normalized matrix persistence: levels (columns), competencies (rows),
//! and cells, all upserted by natural key so positions stay stable across
//! re-parses.

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::models::{Competency, GuideCell, Level};

/// Upsert a level by `(guide_id, code)`, refreshing its position.
pub async fn upsert_level(
    conn: &mut SqliteConnection,
    guide_id: &str,
    code: &str,
    position: i64,
) -> Result<Level, sqlx::Error> {
    sqlx::query_as::<_, Level>(
        "INSERT INTO levels (id, guide_id, code, position) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(guide_id, code) DO UPDATE SET position = excluded.position \
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(guide_id)
    .bind(code)
    .bind(position)
    .fetch_one(conn)
    .await
}

/// Upsert a competency by `(guide_id, name)`, refreshing its position.
pub async fn upsert_competency(
    conn: &mut SqliteConnection,
    guide_id: &str,
    name: &str,
    position: i64,
) -> Result<Competency, sqlx::Error> {
    sqlx::query_as::<_, Competency>(
        "INSERT INTO competencies (id, guide_id, name, position) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(guide_id, name) DO UPDATE SET position = excluded.position \
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(guide_id)
    .bind(name)
    .bind(position)
    .fetch_one(conn)
    .await
}

/// Upsert a cell by `(competency_id, level_id)`.
///
/// The source artifact pointer is only overwritten when provided.
pub async fn upsert_cell(
    conn: &mut SqliteConnection,
    guide_id: &str,
    competency_id: &str,
    level_id: &str,
    definition_text: &str,
    source_artifact_id: Option<&str>,
) -> Result<GuideCell, sqlx::Error> {
    sqlx::query_as::<_, GuideCell>(
        "INSERT INTO guide_cells \
           (id, guide_id, competency_id, level_id, definition_text, source_artifact_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(competency_id, level_id) DO UPDATE SET \
             definition_text = excluded.definition_text, \
             source_artifact_id = COALESCE(excluded.source_artifact_id, guide_cells.source_artifact_id) \
         RETURNING *",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(guide_id)
    .bind(competency_id)
    .bind(level_id)
    .bind(definition_text)
    .bind(source_artifact_id)
    .fetch_one(conn)
    .await
}

/// Levels for a guide in column order.
pub async fn list_levels(
    conn: &mut SqliteConnection,
    guide_id: &str,
) -> Result<Vec<Level>, sqlx::Error> {
    sqlx::query_as::<_, Level>("SELECT * FROM levels WHERE guide_id = ?1 ORDER BY position")
        .bind(guide_id)
        .fetch_all(conn)
        .await
}

/// Competencies for a guide in row order.
pub async fn list_competencies(
    conn: &mut SqliteConnection,
    guide_id: &str,
) -> Result<Vec<Competency>, sqlx::Error> {
    sqlx::query_as::<_, Competency>(
        "SELECT * FROM competencies WHERE guide_id = ?1 ORDER BY position",
    )
    .bind(guide_id)
    .fetch_all(conn)
    .await
}

/// All cells for a guide.
pub async fn list_cells(
    conn: &mut SqliteConnection,
    guide_id: &str,
) -> Result<Vec<GuideCell>, sqlx::Error> {
    sqlx::query_as::<_, GuideCell>("SELECT * FROM guide_cells WHERE guide_id = ?1")
        .bind(guide_id)
        .fetch_all(conn)
        .await
}

/// Cells for one level of a guide.
pub async fn list_cells_for_level(
    conn: &mut SqliteConnection,
    guide_id: &str,
    level_id: &str,
) -> Result<Vec<GuideCell>, sqlx::Error> {
    sqlx::query_as::<_, GuideCell>(
        "SELECT * FROM guide_cells WHERE guide_id = ?1 AND level_id = ?2",
    )
    .bind(guide_id)
    .bind(level_id)
    .fetch_all(conn)
    .await
}

/// Fetch a level by id, scoped to its guide.
pub async fn get_level(
    conn: &mut SqliteConnection,
    guide_id: &str,
    level_id: &str,
) -> Result<Option<Level>, sqlx::Error> {
    sqlx::query_as::<_, Level>("SELECT * FROM levels WHERE id = ?1 AND guide_id = ?2")
        .bind(level_id)
        .bind(guide_id)
        .fetch_optional(conn)
        .await
}

/// Count of cells produced by the parse phase.
pub async fn count_cells(
    conn: &mut SqliteConnection,
    guide_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM guide_cells WHERE guide_id = ?1")
        .bind(guide_id)
        .fetch_one(conn)
        .await
}
