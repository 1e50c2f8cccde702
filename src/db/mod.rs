//! SQLite pool setup and schema.
//!
//! All persistent state — guides, artifacts, parse runs, the normalized
//! matrix, generation rows, and the task queue itself — lives in one SQLite
//! database. The schema is created idempotently at startup; UUIDs are stored
//! as TEXT, JSON payloads as TEXT, timestamps as `datetime('now')` strings.

pub mod models;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    id              TEXT PRIMARY KEY,
    website_url     TEXT NOT NULL UNIQUE,
    name            TEXT,
    context         TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS guides (
    id                TEXT PRIMARY KEY,
    company_id        TEXT NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
    role_title        TEXT,
    status            TEXT NOT NULL,
    pdf_path          TEXT NOT NULL,
    original_filename TEXT,
    mime_type         TEXT,
    error_message     TEXT,
    created_at        TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at        TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS guide_artifacts (
    id              TEXT PRIMARY KEY,
    guide_id        TEXT NOT NULL REFERENCES guides(id) ON DELETE CASCADE,
    kind            TEXT NOT NULL,
    content_json    TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_guide_artifacts_guide_kind
    ON guide_artifacts(guide_id, kind);

CREATE TABLE IF NOT EXISTS parse_runs (
    id                  TEXT PRIMARY KEY,
    guide_id            TEXT NOT NULL REFERENCES guides(id) ON DELETE CASCADE,
    strategy            TEXT NOT NULL,
    status              TEXT NOT NULL,
    confidence          REAL,
    model               TEXT,
    prompt_version      TEXT,
    input_artifact_id   TEXT,
    output_artifact_id  TEXT,
    error_message       TEXT,
    created_at          TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS levels (
    id          TEXT PRIMARY KEY,
    guide_id    TEXT NOT NULL REFERENCES guides(id) ON DELETE CASCADE,
    code        TEXT NOT NULL,
    title       TEXT,
    position    INTEGER NOT NULL,
    UNIQUE (guide_id, code)
);

CREATE TABLE IF NOT EXISTS competencies (
    id          TEXT PRIMARY KEY,
    guide_id    TEXT NOT NULL REFERENCES guides(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    position    INTEGER NOT NULL,
    UNIQUE (guide_id, name)
);

CREATE TABLE IF NOT EXISTS guide_cells (
    id                  TEXT PRIMARY KEY,
    guide_id            TEXT NOT NULL REFERENCES guides(id) ON DELETE CASCADE,
    competency_id       TEXT NOT NULL REFERENCES competencies(id) ON DELETE CASCADE,
    level_id            TEXT NOT NULL REFERENCES levels(id) ON DELETE CASCADE,
    definition_text     TEXT,
    source_artifact_id  TEXT,
    UNIQUE (competency_id, level_id)
);

CREATE TABLE IF NOT EXISTS cell_generations (
    id              TEXT PRIMARY KEY,
    guide_id        TEXT NOT NULL REFERENCES guides(id) ON DELETE CASCADE,
    cell_id         TEXT NOT NULL REFERENCES guide_cells(id) ON DELETE CASCADE,
    prompt_name     TEXT NOT NULL,
    prompt_version  TEXT NOT NULL,
    status          TEXT NOT NULL,
    content_json    TEXT,
    model           TEXT,
    trace_id        TEXT,
    error_message   TEXT,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (cell_id, prompt_name, prompt_version)
);

CREATE TABLE IF NOT EXISTS task_queue (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    queue       TEXT NOT NULL,
    args_json   TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'PENDING',
    attempts    INTEGER NOT NULL DEFAULT 0,
    run_at      TEXT NOT NULL,
    locked_at   TEXT,
    last_error  TEXT,
    created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_task_queue_poll
    ON task_queue(queue, status, run_at);
"#;

/// Open a pool against `database_url` and ensure the schema exists.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if the URL is invalid, the file cannot be
/// created, or schema creation fails.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if any statement fails.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}
