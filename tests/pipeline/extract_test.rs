//! Extract executor: quality gate, artifacts, audit rows, idempotent replay.

use std::sync::Arc;

use levelforge::repos::guide as guide_repo;
use levelforge::service::guide::{self, ExtractOutcome};
use levelforge::status::GuideStatus;
use levelforge::tasks;

use crate::common::{self, FakeExtractor, MemoryStorage, ScriptedProvider};

async fn seed_with_pdf(
    pool: &sqlx::SqlitePool,
    storage: &MemoryStorage,
    status: GuideStatus,
) -> String {
    let (_, guide_id) = common::seed_guide(pool, status).await;
    let pdf_path = sqlx::query_scalar::<_, String>("SELECT pdf_path FROM guides WHERE id = ?1")
        .bind(&guide_id)
        .fetch_one(pool)
        .await
        .expect("pdf path");
    storage.put(&pdf_path, b"%PDF-1.7 fake content".to_vec());
    guide_id
}

#[tokio::test]
async fn rich_pdf_reaches_text_extracted() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let guide_id = seed_with_pdf(&pool, &storage, GuideStatus::Queued).await;
    let ctx = common::test_context(
        pool.clone(),
        storage.clone(),
        Arc::new(ScriptedProvider::new(vec![])),
        Arc::new(FakeExtractor::rich()),
    );

    let outcome = guide::extract_pdf_text(&ctx, &guide_id).await.expect("extract");
    match outcome {
        ExtractOutcome::Completed { status, confidence } => {
            assert_eq!(status, GuideStatus::TextExtracted);
            assert!(confidence >= 0.20);
        }
        ExtractOutcome::Skipped { .. } => panic!("first run must perform the extraction"),
    }
    assert_eq!(common::guide_status(&pool, &guide_id).await, "TEXT_EXTRACTED");

    // PDF_TEXT artifact points at the uploaded text blob.
    let mut conn = pool.acquire().await.expect("acquire");
    let artifact = guide_repo::get_artifact(&mut conn, &guide_id, "PDF_TEXT")
        .await
        .expect("artifact query")
        .expect("artifact exists");
    let content: serde_json::Value =
        serde_json::from_str(artifact.content_json.as_deref().expect("content")).expect("json");
    let text_path = content["path"].as_str().expect("path");
    assert!(text_path.ends_with("/extracted.txt"));
    assert!(storage.contains(text_path));
    assert_eq!(content["strategy"], "fake");
    assert!(content["flags"]["has_matrix_signals"].as_bool().expect("flag"));

    // One SUCCESS audit row with the engine-derived strategy.
    let runs = guide_repo::list_parse_runs(&mut conn, &guide_id)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].strategy, "EXTRACT_FAKE");
    assert_eq!(runs[0].status, "SUCCESS");
}

#[tokio::test]
async fn scanned_pdf_fails_the_quality_gate() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let guide_id = seed_with_pdf(&pool, &storage, GuideStatus::Queued).await;
    let ctx = common::test_context(
        pool.clone(),
        storage,
        Arc::new(ScriptedProvider::new(vec![])),
        Arc::new(FakeExtractor::scanned()),
    );

    let outcome = guide::extract_pdf_text(&ctx, &guide_id).await.expect("extract");
    match outcome {
        ExtractOutcome::Completed { status, confidence } => {
            assert_eq!(status, GuideStatus::FailedBadPdf);
            assert!((confidence - 0.10).abs() < 1e-9);
        }
        ExtractOutcome::Skipped { .. } => panic!("first run must perform the extraction"),
    }
    assert_eq!(common::guide_status(&pool, &guide_id).await, "FAILED_BAD_PDF");

    let error_message =
        sqlx::query_scalar::<_, Option<String>>("SELECT error_message FROM guides WHERE id = ?1")
            .bind(&guide_id)
            .fetch_one(&pool)
            .await
            .expect("error message");
    assert_eq!(
        error_message.as_deref(),
        Some("PDF looks scanned/empty (no embedded text)")
    );

    let mut conn = pool.acquire().await.expect("acquire");
    let runs = guide_repo::list_parse_runs(&mut conn, &guide_id)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, "FAILED");
}

#[tokio::test]
async fn scanned_pdf_does_not_chain_the_parse_task() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let guide_id = seed_with_pdf(&pool, &storage, GuideStatus::Queued).await;
    let ctx = common::test_context(
        pool.clone(),
        storage,
        Arc::new(ScriptedProvider::new(vec![])),
        Arc::new(FakeExtractor::scanned()),
    );

    let registry = tasks::build_registry(ctx);
    let handler = registry.get("extract_text").expect("handler").clone();
    let result = handler
        .run(serde_json::json!({ "guide_id": guide_id }))
        .await
        .expect("task runs");

    assert_eq!(result["status"], "FAILED_BAD_PDF");
    assert!(result["chained"].is_null());
    assert_eq!(common::task_rows(&pool, "parse_matrix").await, 0);
}

#[tokio::test]
async fn replay_after_completion_is_a_noop() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let guide_id = seed_with_pdf(&pool, &storage, GuideStatus::Queued).await;
    let ctx = common::test_context(
        pool.clone(),
        storage,
        Arc::new(ScriptedProvider::new(vec![])),
        Arc::new(FakeExtractor::rich()),
    );

    guide::extract_pdf_text(&ctx, &guide_id).await.expect("first run");

    let replay = guide::extract_pdf_text(&ctx, &guide_id).await.expect("replay");
    match replay {
        ExtractOutcome::Skipped { status } => assert_eq!(status, GuideStatus::TextExtracted),
        ExtractOutcome::Completed { .. } => panic!("replay must not re-run the phase"),
    }

    // No second audit row, no status movement.
    let mut conn = pool.acquire().await.expect("acquire");
    let runs = guide_repo::list_parse_runs(&mut conn, &guide_id)
        .await
        .expect("runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(common::guide_status(&pool, &guide_id).await, "TEXT_EXTRACTED");
}
