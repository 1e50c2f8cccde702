//! Claim-primitive semantics: compare-and-set, idempotent replay, and
//! exactly-one-winner under concurrency.

use levelforge::repos::guide as guide_repo;
use levelforge::status::GuideStatus;

use crate::common;

#[tokio::test]
async fn claim_returns_true_then_false() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::Queued).await;

    let mut conn = pool.acquire().await.expect("acquire");
    let first = guide_repo::claim_status(
        &mut conn,
        &guide_id,
        GuideStatus::Queued,
        GuideStatus::ExtractingText,
    )
    .await
    .expect("claim");
    let second = guide_repo::claim_status(
        &mut conn,
        &guide_id,
        GuideStatus::Queued,
        GuideStatus::ExtractingText,
    )
    .await
    .expect("claim");

    assert!(first);
    assert!(!second);
    assert_eq!(common::guide_status(&pool, &guide_id).await, "EXTRACTING_TEXT");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_have_exactly_one_winner() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::MatrixParsed).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let guide_id = guide_id.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = pool.acquire().await.expect("acquire");
            guide_repo::claim_status(
                &mut conn,
                &guide_id,
                GuideStatus::MatrixParsed,
                GuideStatus::GeneratingExamples,
            )
            .await
            .expect("claim")
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.expect("join") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(
        common::guide_status(&pool, &guide_id).await,
        "GENERATING_EXAMPLES"
    );
}

#[tokio::test]
async fn terminal_guides_reject_phase_claims() {
    let (pool, _dir) = common::test_pool().await;
    let (_, guide_id) = common::seed_guide(&pool, GuideStatus::Done).await;

    let mut conn = pool.acquire().await.expect("acquire");
    for (from, to) in [
        (GuideStatus::Queued, GuideStatus::ExtractingText),
        (GuideStatus::TextExtracted, GuideStatus::ParsingMatrix),
        (GuideStatus::MatrixParsed, GuideStatus::GeneratingExamples),
        (GuideStatus::GeneratingExamples, GuideStatus::Done),
    ] {
        let claimed = guide_repo::claim_status(&mut conn, &guide_id, from, to)
            .await
            .expect("claim");
        assert!(!claimed, "{from} -> {to} must not claim a DONE guide");
    }
    assert_eq!(common::guide_status(&pool, &guide_id).await, "DONE");
}
