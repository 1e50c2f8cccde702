//! Task queue semantics: atomic claims, delayed delivery, late
//! acknowledgement, lease reaping, and worker retry classification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use levelforge::errors::AppError;
use levelforge::queue::{self, RetryPolicy, TaskHandler, TaskQueue, TaskRegistry};

use crate::common;

fn test_route(_: &str) -> &'static str {
    "default"
}

struct FlakyTask {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for FlakyTask {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn queue(&self) -> &'static str {
        "default"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(3, 0)
    }

    async fn run(&self, _args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            anyhow::bail!("transient infrastructure failure");
        }
        Ok(json!({ "ok": true }))
    }
}

struct DomainFailTask;

#[async_trait]
impl TaskHandler for DomainFailTask {
    fn name(&self) -> &'static str {
        "domain_fail"
    }

    fn queue(&self) -> &'static str {
        "default"
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(3, 0)
    }

    async fn run(&self, _args: serde_json::Value) -> anyhow::Result<serde_json::Value> {
        Err(AppError::validation("rejected input").into())
    }
}

async fn task_row(pool: &sqlx::SqlitePool, id: &str) -> (String, i64, Option<String>) {
    sqlx::query_as::<_, (String, i64, Option<String>)>(
        "SELECT status, attempts, last_error FROM task_queue WHERE id = ?1",
    )
    .bind(id)
    .fetch_one(pool)
    .await
    .expect("task row")
}

#[tokio::test]
async fn claim_is_exclusive_and_acknowledgement_is_late() {
    let (pool, _dir) = common::test_pool().await;
    let queue = TaskQueue::new(pool.clone(), test_route);

    let id = queue
        .enqueue("flaky", &json!({ "n": 1 }), None)
        .await
        .expect("enqueue");

    let claimed = queue.claim_due("default").await.expect("claim").expect("task");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.status, "RUNNING");

    // Still RUNNING: nothing else can claim it.
    assert!(queue.claim_due("default").await.expect("claim").is_none());

    queue.mark_done(&id).await.expect("ack");
    let (status, _, _) = task_row(&pool, &id).await;
    assert_eq!(status, "DONE");
}

#[tokio::test]
async fn countdown_delays_visibility() {
    let (pool, _dir) = common::test_pool().await;
    let queue = TaskQueue::new(pool.clone(), test_route);

    queue
        .enqueue("flaky", &json!({}), Some(Duration::from_secs(3600)))
        .await
        .expect("enqueue");

    assert!(queue.claim_due("default").await.expect("claim").is_none());
}

#[tokio::test]
async fn expired_leases_are_redelivered() {
    let (pool, _dir) = common::test_pool().await;
    let queue = TaskQueue::new(pool.clone(), test_route);

    let id = queue.enqueue("flaky", &json!({}), None).await.expect("enqueue");
    queue.claim_due("default").await.expect("claim").expect("task");

    // Lease of zero: the running row is immediately considered lost.
    let reaped = queue.reap_expired(Duration::ZERO).await.expect("reap");
    assert_eq!(reaped, 1);

    let redelivered = queue.claim_due("default").await.expect("claim").expect("task");
    assert_eq!(redelivered.id, id);
    assert_eq!(redelivered.attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_retry_infrastructure_and_fail_domain_errors() {
    let (pool, _dir) = common::test_pool().await;
    let queue = TaskQueue::new(pool.clone(), test_route);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = TaskRegistry::new();
    registry.register(Arc::new(FlakyTask {
        calls: Arc::clone(&calls),
    }));
    registry.register(Arc::new(DomainFailTask));

    let flaky_id = queue.enqueue("flaky", &json!({}), None).await.expect("enqueue");
    let domain_id = queue
        .enqueue("domain_fail", &json!({}), None)
        .await
        .expect("enqueue");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let workers = tokio::spawn(queue::run_workers(
        queue.clone(),
        Arc::new(registry),
        1,
        Duration::from_millis(20),
        Duration::from_secs(300),
        shutdown_rx,
    ));

    // Wait until both deliveries reach a terminal queue status.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (flaky_status, _, _) = task_row(&pool, &flaky_id).await;
        let (domain_status, _, _) = task_row(&pool, &domain_id).await;
        if flaky_status == "DONE" && domain_status == "FAILED" {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue did not settle: flaky={flaky_status} domain={domain_status}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let _ = shutdown_tx.send(true);
    workers.await.expect("workers join");

    // Infra failure was retried once, then succeeded.
    let (_, flaky_attempts, _) = task_row(&pool, &flaky_id).await;
    assert_eq!(flaky_attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Domain failure was terminal on the first delivery.
    let (_, domain_attempts, domain_error) = task_row(&pool, &domain_id).await;
    assert_eq!(domain_attempts, 1);
    assert!(domain_error.expect("error").contains("VALIDATION_ERROR"));
}
