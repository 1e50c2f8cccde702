//! The full happy path through the workers: upload -> extract -> parse ->
//! fan-out -> generate -> finalize -> rendered results.

use std::sync::Arc;
use std::time::Duration;

use levelforge::queue;
use levelforge::service::{generation, guide};
use levelforge::tasks;

use crate::common::{self, FakeExtractor, MatrixProvider, MemoryStorage};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_levels_by_two_competencies_reaches_done() {
    let (pool, _dir) = common::test_pool().await;
    let storage = Arc::new(MemoryStorage::new());
    let provider = Arc::new(MatrixProvider::new(
        vec!["L1", "L2", "L3"],
        vec!["Craft", "Collaboration"],
    ));
    let ctx = common::test_context(
        pool.clone(),
        storage,
        provider,
        Arc::new(FakeExtractor::rich()),
    );

    let registry = Arc::new(tasks::build_registry(ctx.clone()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = tokio::spawn(queue::run_workers(
        ctx.queue.clone(),
        Arc::clone(&registry),
        1,
        Duration::from_millis(20),
        Duration::from_secs(300),
        shutdown_rx,
    ));

    let response = guide::create_guide_from_upload(
        &ctx,
        guide::GuideUpload {
            website_url: "https://acme.example".to_string(),
            role_title: "Software Engineer".to_string(),
            filename: "guide.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            bytes: b"%PDF-1.7 leveling guide".to_vec(),
            company_name: Some("Acme".to_string()),
            company_context: None,
        },
    )
    .await
    .expect("create guide");
    assert_eq!(response.status, "QUEUED");
    let guide_id = response.guide_id.clone();

    // The pipeline drives itself; wait for the terminal state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let status = common::guide_status(&pool, &guide_id).await;
        if status == "DONE" {
            break;
        }
        assert!(
            !status.starts_with("FAILED"),
            "pipeline failed with status {status}"
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "pipeline did not finish, stuck at {status}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = shutdown_tx.send(true);
    workers.await.expect("workers join");

    // Fan-out arithmetic: 3 levels x ceil(2/2) chunks = 3 generate tasks.
    assert_eq!(common::task_rows(&pool, "generate_cells").await, 3);
    assert_eq!(common::task_rows(&pool, "parse_matrix").await, 1);
    assert_eq!(common::task_rows(&pool, "kickoff_generation").await, 1);

    // Generate completeness at DONE: every cell has a SUCCESS row.
    let cells = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM guide_cells WHERE guide_id = ?1")
        .bind(&guide_id)
        .fetch_one(&pool)
        .await
        .expect("cells");
    let successes = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM cell_generations WHERE guide_id = ?1 AND status = 'SUCCESS'",
    )
    .bind(&guide_id)
    .fetch_one(&pool)
    .await
    .expect("successes");
    assert_eq!(cells, 6);
    assert_eq!(successes, 6);

    // Rendered results: complete progress, three examples per cell.
    let results = generation::get_results(&ctx, &guide_id, "v1")
        .await
        .expect("results");
    assert_eq!(results.status, "DONE");
    assert_eq!(results.progress.expected, 6);
    assert_eq!(results.progress.completed, 6);
    assert_eq!(results.levels.len(), 3);
    assert_eq!(results.competencies.len(), 2);
    for competency in &results.competencies {
        for cell in &competency.cells {
            assert_eq!(cell.generation_status, "SUCCESS");
            assert_eq!(cell.examples.len(), 3);
        }
    }

    // Status poll contract still answers after completion.
    let status = guide::get_status(&ctx, &guide_id).await.expect("status");
    assert_eq!(status.status, "DONE");
}
