//! Parse executor: claim staging, the JSON repair round-trip, persistence,
//! and the record-then-propagate failure path.

use std::sync::Arc;

use levelforge::errors::{AppError, ErrorCode};
use levelforge::llm::LlmError;
use levelforge::repos::guide as guide_repo;
use levelforge::service::guide;
use levelforge::status::GuideStatus;

use crate::common::{self, FakeExtractor, MemoryStorage, ScriptedProvider};

const TEXT_PATH: &str = "companies/c/guides/g/extracted.txt";

fn matrix_json() -> String {
    serde_json::json!({
        "confidence": 0.85,
        "role": "Software Engineer",
        "levels": ["L1", "L2", "L3"],
        "competencies": [
            {"name": "Craft", "cells": {"L1": "Writes code", "L2": "Reviews code", "L3": "Designs systems"}},
            {"name": "Collaboration", "cells": {"L1": "Pairs", "L2": "Mentors", "L3": "Leads"}}
        ],
        "notes": null,
    })
    .to_string()
}

/// Guide in TEXT_EXTRACTED with a PDF_TEXT artifact and its text blob.
async fn seed_extracted(pool: &sqlx::SqlitePool, storage: &MemoryStorage) -> String {
    let (_, guide_id) = common::seed_guide(pool, GuideStatus::TextExtracted).await;
    let mut conn = pool.acquire().await.expect("acquire");
    guide_repo::upsert_artifact(
        &mut conn,
        &guide_id,
        "PDF_TEXT",
        &serde_json::json!({ "path": TEXT_PATH, "strategy": "fake", "confidence": 0.9 }),
    )
    .await
    .expect("artifact");
    storage.put(TEXT_PATH, b"Level L1 competency scope expectations".to_vec());
    guide_id
}

#[tokio::test]
async fn malformed_json_is_repaired_then_persisted() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let guide_id = seed_extracted(&pool, &storage).await;

    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok("}{".to_string()),
        Ok(matrix_json()),
    ]));
    let ctx = common::test_context(
        pool.clone(),
        storage,
        provider.clone(),
        Arc::new(FakeExtractor::rich()),
    );

    let parsed = guide::parse_matrix(&ctx, &guide_id).await.expect("parse");
    assert_eq!(provider.calls(), 2);
    assert_eq!(parsed.levels, vec!["L1", "L2", "L3"]);
    assert_eq!(common::guide_status(&pool, &guide_id).await, "MATRIX_PARSED");

    // Normalized rows: 3 levels, 2 competencies, 6 cells.
    let levels = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM levels WHERE guide_id = ?1")
        .bind(&guide_id)
        .fetch_one(&pool)
        .await
        .expect("levels");
    let comps =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM competencies WHERE guide_id = ?1")
            .bind(&guide_id)
            .fetch_one(&pool)
            .await
            .expect("competencies");
    let cells =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM guide_cells WHERE guide_id = ?1")
            .bind(&guide_id)
            .fetch_one(&pool)
            .await
            .expect("cells");
    assert_eq!((levels, comps, cells), (3, 2, 6));

    let mut conn = pool.acquire().await.expect("acquire");
    let runs = guide_repo::list_parse_runs(&mut conn, &guide_id)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].strategy, "PARSE_MATRIX_LLM_V1");
    assert_eq!(runs[0].status, "SUCCESS");
    assert!((runs[0].confidence.expect("confidence") - 0.85).abs() < 1e-9);

    let artifact = guide_repo::get_artifact(&mut conn, &guide_id, "MATRIX_JSON")
        .await
        .expect("query")
        .expect("exists");
    assert!(artifact.content_json.expect("content").contains("Craft"));
}

#[tokio::test]
async fn llm_failure_is_recorded_then_propagated() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let guide_id = seed_extracted(&pool, &storage).await;

    let provider = Arc::new(ScriptedProvider::new(vec![Err(LlmError::NonRetryable(
        "prompt too large".to_string(),
    ))]));
    let ctx = common::test_context(
        pool.clone(),
        storage,
        provider,
        Arc::new(FakeExtractor::rich()),
    );

    let err = guide::parse_matrix(&ctx, &guide_id).await.expect_err("must fail");
    let app = err.downcast_ref::<AppError>().expect("domain error");
    assert_eq!(app.code, ErrorCode::LlmNonRetryable);

    // Audit row first, then the terminal status.
    assert_eq!(common::guide_status(&pool, &guide_id).await, "FAILED_PARSE");
    let mut conn = pool.acquire().await.expect("acquire");
    let runs = guide_repo::list_parse_runs(&mut conn, &guide_id)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "FAILED");
    assert!(runs[0]
        .error_message
        .as_deref()
        .expect("message")
        .contains("prompt too large"));
}

#[tokio::test]
async fn replay_after_success_returns_the_stored_matrix() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let guide_id = seed_extracted(&pool, &storage).await;

    let provider = Arc::new(ScriptedProvider::new(vec![Ok(matrix_json())]));
    let ctx = common::test_context(
        pool.clone(),
        storage,
        provider.clone(),
        Arc::new(FakeExtractor::rich()),
    );

    guide::parse_matrix(&ctx, &guide_id).await.expect("first parse");
    assert_eq!(provider.calls(), 1);

    let replay = guide::parse_matrix(&ctx, &guide_id).await.expect("replay");
    assert_eq!(replay.competencies.len(), 2);
    // No second provider call, no second audit row: the stored artifact answers.
    assert_eq!(provider.calls(), 1);
    let mut conn = pool.acquire().await.expect("acquire");
    let runs = guide_repo::list_parse_runs(&mut conn, &guide_id)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn wrong_state_is_a_validation_conflict() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::Queued).await;
    let ctx = common::test_context(
        pool.clone(),
        storage,
        Arc::new(ScriptedProvider::new(vec![])),
        Arc::new(FakeExtractor::rich()),
    );

    let err = guide::parse_matrix(&ctx, &guide_id).await.expect_err("must fail");
    let app = err.downcast_ref::<AppError>().expect("domain error");
    assert_eq!(app.code, ErrorCode::ValidationError);
    assert!(app.message.contains("TEXT_EXTRACTED"));
}
