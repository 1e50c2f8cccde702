//! Generation phase: fan-out arithmetic, duplicate-kickoff idempotency,
//! chunk execution, semantic-validation failures, finalize decisions, and
//! the rendered results view.

use std::sync::Arc;

use levelforge::errors::{AppError, ErrorCode};
use levelforge::repos::generation as gen_repo;
use levelforge::service::generation;
use levelforge::status::GuideStatus;

use crate::common::{self, FakeExtractor, MatrixProvider, MemoryStorage, ScriptedProvider};

fn ctx_with_provider(
    pool: sqlx::SqlitePool,
    provider: Arc<dyn levelforge::llm::providers::LlmProvider>,
) -> levelforge::service::PipelineContext {
    common::test_context(
        pool,
        Arc::new(MemoryStorage::new()),
        provider,
        Arc::new(FakeExtractor::rich()),
    )
}

// ---------------------------------------------------------------------------
// Kickoff fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn small_matrix_fans_out_one_chunk_per_level() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::MatrixParsed).await;
    common::seed_matrix(&pool, &guide_id, &["L1", "L2", "L3"], &["Craft", "Collaboration"]).await;
    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));

    let outcome = generation::start_generation(&ctx, &guide_id, "v1")
        .await
        .expect("kickoff");

    // 2 competencies <= 8, so one chunk of size 2; 3 levels x 1 chunk.
    assert_eq!(outcome.tasks_enqueued, 3);
    assert_eq!(outcome.chunk_size, 2);
    assert_eq!(outcome.status, GuideStatus::GeneratingExamples);
    assert_eq!(common::task_rows(&pool, "generate_cells").await, 3);
    assert_eq!(common::task_rows(&pool, "finalize_generation").await, 1);
}

#[tokio::test]
async fn large_matrix_uses_the_default_chunk_size() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::MatrixParsed).await;
    let comps: Vec<String> = (0..13).map(|i| format!("Competency {i}")).collect();
    let comp_refs: Vec<&str> = comps.iter().map(String::as_str).collect();
    common::seed_matrix(&pool, &guide_id, &["L1", "L2"], &comp_refs).await;
    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));

    let outcome = generation::start_generation(&ctx, &guide_id, "v1")
        .await
        .expect("kickoff");

    // 13 competencies > 8: chunks of 6 -> [0,6) [6,12) [12,13); 2 levels x 3.
    assert_eq!(outcome.chunk_size, 6);
    assert_eq!(outcome.tasks_enqueued, 6);
}

#[tokio::test]
async fn duplicate_kickoff_enqueues_nothing() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::MatrixParsed).await;
    common::seed_matrix(&pool, &guide_id, &["L1", "L2", "L3"], &["Craft", "Collaboration"]).await;
    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));

    let first = generation::start_generation(&ctx, &guide_id, "v1")
        .await
        .expect("first kickoff");
    assert_eq!(first.tasks_enqueued, 3);

    let second = generation::start_generation(&ctx, &guide_id, "v1")
        .await
        .expect("second kickoff");
    assert_eq!(second.status, GuideStatus::GeneratingExamples);
    assert_eq!(second.tasks_enqueued, 0);

    // Fan-out is not doubled.
    assert_eq!(common::task_rows(&pool, "generate_cells").await, 3);
    assert_eq!(common::task_rows(&pool, "finalize_generation").await, 1);
}

// ---------------------------------------------------------------------------
// Chunk executor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn chunk_writes_success_rows_and_replays_as_noop() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::GeneratingExamples).await;
    let level_ids =
        common::seed_matrix(&pool, &guide_id, &["L1"], &["Craft", "Collaboration"]).await;
    let provider = Arc::new(MatrixProvider::new(vec!["L1"], vec!["Craft", "Collaboration"]));
    let ctx = ctx_with_provider(pool.clone(), provider.clone());

    let outcome = generation::generate_level_chunk(&ctx, &guide_id, &level_ids[0], 0, 2, "v1")
        .await
        .expect("chunk");
    assert_eq!(outcome.written, 2);
    assert!(outcome.skipped_reason.is_none());
    assert_eq!(provider.calls(), 1);

    let mut conn = pool.acquire().await.expect("acquire");
    let rows = gen_repo::list_for_guide(&mut conn, &guide_id, "generate_examples_batch", "v1")
        .await
        .expect("rows");
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.status, "SUCCESS");
        let content: serde_json::Value =
            serde_json::from_str(row.content_json.as_deref().expect("content")).expect("json");
        assert_eq!(content["examples"].as_array().expect("examples").len(), 3);
    }
    drop(conn);

    // Replay skips: every cell already has a SUCCESS row.
    let replay = generation::generate_level_chunk(&ctx, &guide_id, &level_ids[0], 0, 2, "v1")
        .await
        .expect("replay");
    assert_eq!(replay.skipped_reason, Some("already_done"));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn forbidden_term_fails_both_attempts_and_marks_cells() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::GeneratingExamples).await;
    let level_ids = common::seed_matrix(&pool, &guide_id, &["L1"], &["Craft"]).await;

    let tainted = serde_json::json!({
        "level": "L1",
        "results": [{
            "competency": "Craft",
            "examples": [
                {"title": "a", "example": "Migrated the stack to Kubernetes. Wrote the rollout plan."},
                {"title": "b", "example": "Tuned the deployment pipeline. Measured the speedup carefully."},
                {"title": "c", "example": "Paired on the incident review. Captured the followups."}
            ]
        }]
    })
    .to_string();
    // Same invalid output on the repair attempt too.
    let provider = Arc::new(ScriptedProvider::new(vec![
        Ok(tainted.clone()),
        Ok(tainted),
    ]));
    let ctx = ctx_with_provider(pool.clone(), provider.clone());

    let err = generation::generate_level_chunk(&ctx, &guide_id, &level_ids[0], 0, 1, "v1")
        .await
        .expect_err("must fail");
    let app = err.downcast_ref::<AppError>().expect("domain error");
    assert_eq!(app.code, ErrorCode::InternalError);
    assert!(app.message.contains("kubernetes"));
    assert_eq!(provider.calls(), 2);

    let mut conn = pool.acquire().await.expect("acquire");
    let rows = gen_repo::list_for_guide(&mut conn, &guide_id, "generate_examples_batch", "v1")
        .await
        .expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "FAILED");
    assert!(rows[0]
        .error_message
        .as_deref()
        .expect("message")
        .contains("kubernetes"));
}

#[tokio::test]
async fn chunk_rejects_guides_outside_the_generate_phase() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::TextExtracted).await;
    let level_ids = common::seed_matrix(&pool, &guide_id, &["L1"], &["Craft"]).await;
    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));

    let err = generation::generate_level_chunk(&ctx, &guide_id, &level_ids[0], 0, 1, "v1")
        .await
        .expect_err("must fail");
    let app = err.downcast_ref::<AppError>().expect("domain error");
    assert_eq!(app.code, ErrorCode::ValidationError);
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

async fn upsert_outcomes(pool: &sqlx::SqlitePool, guide_id: &str, statuses: &[&str]) {
    let cell_ids =
        sqlx::query_scalar::<_, String>("SELECT id FROM guide_cells WHERE guide_id = ?1 ORDER BY id")
            .bind(guide_id)
            .fetch_all(pool)
            .await
            .expect("cells");
    let mut conn = pool.acquire().await.expect("acquire");
    for (cell_id, status) in cell_ids.iter().zip(statuses) {
        gen_repo::upsert_cell_generation(
            &mut conn,
            gen_repo::NewCellGeneration {
                guide_id,
                cell_id,
                prompt_name: "generate_examples_batch",
                prompt_version: "v1",
                status,
                content_json: None,
                model: None,
                trace_id: None,
                error_message: (*status == "FAILED").then_some("LLM validation failed"),
            },
        )
        .await
        .expect("upsert");
    }
}

#[tokio::test]
async fn finalize_waits_while_rows_are_missing() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::GeneratingExamples).await;
    common::seed_matrix(&pool, &guide_id, &["L1", "L2"], &["Craft", "Collaboration"]).await;
    upsert_outcomes(&pool, &guide_id, &["SUCCESS", "SUCCESS"]).await; // 2 of 4
    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));

    let outcome = generation::finalize(&ctx, &guide_id, "v1").await.expect("finalize");
    assert_eq!(outcome.status, GuideStatus::GeneratingExamples);
    assert_eq!(outcome.total_cells, 4);
    assert_eq!(outcome.total_rows, 2);
    assert_eq!(common::guide_status(&pool, &guide_id).await, "GENERATING_EXAMPLES");
}

#[tokio::test]
async fn finalize_reaches_done_when_every_cell_succeeded() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::GeneratingExamples).await;
    common::seed_matrix(&pool, &guide_id, &["L1", "L2"], &["Craft", "Collaboration"]).await;
    upsert_outcomes(&pool, &guide_id, &["SUCCESS"; 4]).await;
    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));

    let outcome = generation::finalize(&ctx, &guide_id, "v1").await.expect("finalize");
    assert_eq!(outcome.status, GuideStatus::Done);
    assert_eq!(outcome.success, 4);
    assert_eq!(outcome.failed, 0);

    // Generate completeness: SUCCESS rows == cells at DONE.
    assert_eq!(outcome.success, outcome.total_cells);

    // Idempotent once terminal.
    let replay = generation::finalize(&ctx, &guide_id, "v1").await.expect("replay");
    assert_eq!(replay.status, GuideStatus::Done);
}

#[tokio::test]
async fn finalize_fails_generation_on_any_failed_cell() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::GeneratingExamples).await;
    common::seed_matrix(&pool, &guide_id, &["L1", "L2"], &["Craft", "Collaboration"]).await;
    upsert_outcomes(&pool, &guide_id, &["SUCCESS", "SUCCESS", "SUCCESS", "FAILED"]).await;
    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));

    let outcome = generation::finalize(&ctx, &guide_id, "v1").await.expect("finalize");
    assert_eq!(outcome.status, GuideStatus::FailedGeneration);
    assert_eq!(outcome.success, 3);
    assert_eq!(outcome.failed, 1);
    assert_eq!(common::guide_status(&pool, &guide_id).await, "FAILED_GENERATION");
}

// ---------------------------------------------------------------------------
// Results view
// ---------------------------------------------------------------------------

#[tokio::test]
async fn results_render_cells_with_statuses_and_progress() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::GeneratingExamples).await;
    common::seed_matrix(&pool, &guide_id, &["L1", "L2"], &["Craft", "Collaboration"]).await;
    upsert_outcomes(&pool, &guide_id, &["SUCCESS", "SUCCESS", "FAILED"]).await; // 4th pending

    // Drop one cell so the view renders a MISSING_CELL placeholder.
    sqlx::query(
        "DELETE FROM guide_cells WHERE id = \
         (SELECT id FROM guide_cells WHERE guide_id = ?1 \
          AND id NOT IN (SELECT cell_id FROM cell_generations) LIMIT 1)",
    )
    .bind(&guide_id)
    .execute(&pool)
    .await
    .expect("delete cell");

    let ctx = ctx_with_provider(pool.clone(), Arc::new(ScriptedProvider::new(vec![])));
    let results = generation::get_results(&ctx, &guide_id, "v1").await.expect("results");

    assert_eq!(results.progress.expected, 4);
    assert_eq!(results.progress.completed, 2);
    assert_eq!(results.levels.len(), 2);
    assert_eq!(results.competencies.len(), 2);

    let statuses: Vec<&str> = results
        .competencies
        .iter()
        .flat_map(|c| c.cells.iter().map(|cell| cell.generation_status.as_str()))
        .collect();
    assert_eq!(statuses.len(), 4);
    assert!(statuses.contains(&"SUCCESS"));
    assert!(statuses.contains(&"FAILED"));
    assert!(statuses.contains(&"MISSING_CELL"));
}
