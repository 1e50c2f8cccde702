//! Durable SQLite-backed task queue.
//!
//! Named tasks with JSON arguments, delayed delivery, per-task retry
//! policy, bounded concurrency per named queue, and late acknowledgement:
//! a claimed row stays `RUNNING` until its handler returns, and a reaper
//! returns rows whose lease expired to `PENDING`, so a lost worker means
//! redelivery (at-least-once), never loss.
//!
//! Handler outcome classification:
//! - `Ok` — row marked `DONE`.
//! - `Err` carrying a domain [`AppError`] — structured failure, row marked
//!   `FAILED`, no retry.
//! - any other `Err` — infrastructure failure; redelivered after the
//!   handler's retry delay until its retry budget is exhausted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::models::QueuedTask;
use crate::errors::AppError;

// ---------------------------------------------------------------------------
// Errors and policy
// ---------------------------------------------------------------------------

/// Errors from queue operations themselves (not from task handlers).
#[derive(Debug, Error)]
pub enum QueueError {
    /// Database failure.
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Task arguments could not be serialized.
    #[error("queue serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-task retry policy for infrastructure failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Redeliveries after the first attempt.
    pub max_retries: u32,
    /// Delay before each redelivery.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// Convenience constructor.
    pub const fn new(max_retries: u32, retry_delay_secs: u64) -> Self {
        Self {
            max_retries,
            retry_delay: Duration::from_secs(retry_delay_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers and registry
// ---------------------------------------------------------------------------

/// A named task implementation.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Registry name; also the routing key used by [`TaskQueue::enqueue`].
    fn name(&self) -> &'static str;

    /// Named queue this task runs on.
    fn queue(&self) -> &'static str;

    /// Retry policy for infrastructure failures.
    fn retry_policy(&self) -> RetryPolicy;

    /// Execute one delivery.
    ///
    /// # Errors
    ///
    /// A returned [`AppError`] (inside `anyhow`) is terminal; any other
    /// error triggers redelivery per [`Self::retry_policy`].
    async fn run(&self, args: serde_json::Value) -> anyhow::Result<serde_json::Value>;
}

/// Task registry populated at startup: name → handler.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.name(), handler);
    }

    /// Look up a handler.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    /// Distinct queue names across all registered handlers.
    pub fn queues(&self) -> Vec<&'static str> {
        let mut queues: Vec<&'static str> = self.handlers.values().map(|h| h.queue()).collect();
        queues.sort_unstable();
        queues.dedup();
        queues
    }
}

// ---------------------------------------------------------------------------
// Queue handle
// ---------------------------------------------------------------------------

/// Maps a task name to its named queue at enqueue time.
pub type QueueRouter = fn(&str) -> &'static str;

/// Producer/consumer handle over the `task_queue` table.
///
/// Routing is a plain function so producers (services) and consumers
/// (handlers holding this handle) need no reference cycle through the
/// registry.
#[derive(Clone)]
pub struct TaskQueue {
    pool: SqlitePool,
    router: QueueRouter,
}

impl TaskQueue {
    /// Build a handle with the given routing table.
    pub fn new(pool: SqlitePool, router: QueueRouter) -> Self {
        Self { pool, router }
    }

    /// Enqueue one delivery of `name` with `args`, optionally delayed.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError`] on database failure. Unrouted names land on
    /// the `default` queue and fail at claim time.
    pub async fn enqueue(
        &self,
        name: &str,
        args: &serde_json::Value,
        countdown: Option<Duration>,
    ) -> Result<String, QueueError> {
        let queue = (self.router)(name);
        let id = Uuid::new_v4().to_string();
        let delay_secs = i64::try_from(countdown.unwrap_or(Duration::ZERO).as_secs()).unwrap_or(0);

        sqlx::query(
            "INSERT INTO task_queue (id, name, queue, args_json, status, run_at) \
             VALUES (?1, ?2, ?3, ?4, 'PENDING', strftime('%Y-%m-%d %H:%M:%f', 'now', '+' || ?5 || ' seconds'))",
        )
        .bind(&id)
        .bind(name)
        .bind(queue)
        .bind(args.to_string())
        .bind(delay_secs)
        .execute(&self.pool)
        .await?;

        info!(task = name, queue, id = %id, delay_secs, "task enqueued");
        Ok(id)
    }

    /// Atomically claim the oldest due PENDING row on `queue`.
    ///
    /// The claim marks the row `RUNNING` and stamps `locked_at` in one
    /// UPDATE, so two workers can never take the same delivery.
    pub async fn claim_due(&self, queue: &str) -> Result<Option<QueuedTask>, QueueError> {
        let task = sqlx::query_as::<_, QueuedTask>(
            "UPDATE task_queue \
             SET status = 'RUNNING', locked_at = strftime('%Y-%m-%d %H:%M:%f', 'now'), attempts = attempts + 1 \
             WHERE id = ( \
                 SELECT id FROM task_queue \
                 WHERE queue = ?1 AND status = 'PENDING' AND run_at <= strftime('%Y-%m-%d %H:%M:%f', 'now') \
                 ORDER BY run_at, created_at, rowid LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(queue)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Late acknowledgement: mark a delivery done.
    pub async fn mark_done(&self, task_id: &str) -> Result<(), QueueError> {
        sqlx::query("UPDATE task_queue SET status = 'DONE', locked_at = NULL WHERE id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Terminal failure: no further deliveries.
    pub async fn mark_failed(&self, task_id: &str, error: &str) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE task_queue SET status = 'FAILED', locked_at = NULL, last_error = ?1 \
             WHERE id = ?2",
        )
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reschedule a delivery after an infrastructure failure.
    pub async fn reschedule(
        &self,
        task_id: &str,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE task_queue \
             SET status = 'PENDING', locked_at = NULL, last_error = ?1, \
                 run_at = strftime('%Y-%m-%d %H:%M:%f', 'now', '+' || ?2 || ' seconds') \
             WHERE id = ?3",
        )
        .bind(error)
        .bind(i64::try_from(delay.as_secs()).unwrap_or(0))
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Return expired RUNNING rows to PENDING (worker-loss redelivery).
    pub async fn reap_expired(&self, lease: Duration) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE task_queue \
             SET status = 'PENDING', locked_at = NULL \
             WHERE status = 'RUNNING' \
               AND locked_at <= strftime('%Y-%m-%d %H:%M:%f', 'now', '-' || ?1 || ' seconds')",
        )
        .bind(i64::try_from(lease.as_secs()).unwrap_or(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deliveries of `name` currently enqueued or running (tests, introspection).
    pub async fn count_by_name(&self, name: &str) -> Result<i64, QueueError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM task_queue WHERE name = ?1 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Execute one claimed delivery and acknowledge it.
async fn execute_delivery(queue: &TaskQueue, registry: &TaskRegistry, task: QueuedTask) {
    let Some(handler) = registry.get(&task.name) else {
        error!(task = %task.name, id = %task.id, "no handler registered");
        if let Err(err) = queue.mark_failed(&task.id, "no handler registered").await {
            error!(error = %err, "failed to mark unknown task failed");
        }
        return;
    };

    let args: serde_json::Value = match serde_json::from_str(&task.args_json) {
        Ok(args) => args,
        Err(err) => {
            warn!(task = %task.name, id = %task.id, error = %err, "invalid task arguments");
            if let Err(err) = queue.mark_failed(&task.id, &format!("invalid args: {err}")).await {
                error!(error = %err, "failed to mark task failed");
            }
            return;
        }
    };

    info!(task = %task.name, id = %task.id, attempt = task.attempts, "task start");
    match handler.run(args).await {
        Ok(result) => {
            info!(task = %task.name, id = %task.id, result = %result, "task done");
            if let Err(err) = queue.mark_done(&task.id).await {
                error!(error = %err, "failed to acknowledge task");
            }
        }
        Err(err) => {
            if let Some(app_err) = err.downcast_ref::<AppError>() {
                // Domain failure: structured, terminal, no retry.
                warn!(task = %task.name, id = %task.id, error = %app_err, "task domain failure");
                if let Err(err) = queue.mark_failed(&task.id, &app_err.to_string()).await {
                    error!(error = %err, "failed to mark task failed");
                }
                return;
            }

            let policy = handler.retry_policy();
            let attempts = u32::try_from(task.attempts).unwrap_or(u32::MAX);
            if attempts > policy.max_retries {
                warn!(
                    task = %task.name,
                    id = %task.id,
                    attempts,
                    error = %err,
                    "task retries exhausted"
                );
                if let Err(err) = queue
                    .mark_failed(&task.id, &format!("retries exhausted: {err}"))
                    .await
                {
                    error!(error = %err, "failed to mark task failed");
                }
            } else {
                warn!(
                    task = %task.name,
                    id = %task.id,
                    attempts,
                    delay_secs = policy.retry_delay.as_secs(),
                    error = %err,
                    "task retry"
                );
                if let Err(err) = queue
                    .reschedule(&task.id, policy.retry_delay, &err.to_string())
                    .await
                {
                    error!(error = %err, "failed to reschedule task");
                }
            }
        }
    }
}

/// Run one worker slot: claim one delivery at a time from `queue_name`.
async fn worker_loop(
    queue: TaskQueue,
    registry: Arc<TaskRegistry>,
    queue_name: &'static str,
    poll_interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match queue.claim_due(queue_name).await {
            Ok(Some(task)) => execute_delivery(&queue, &registry, task).await,
            Ok(None) => {
                // Idle: jittered poll so worker slots do not thunder.
                let jitter_ms = rand::thread_rng().gen_range(0..=poll_interval.as_millis() / 4 + 1);
                let wait = poll_interval + Duration::from_millis(u64::try_from(jitter_ms).unwrap_or(0));
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => return,
                }
            }
            Err(err) => {
                error!(queue = queue_name, error = %err, "claim failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }
}

/// Spawn worker slots for every registered queue plus the lease reaper, and
/// run until `shutdown` flips to `true`.
pub async fn run_workers(
    queue: TaskQueue,
    registry: Arc<TaskRegistry>,
    worker_concurrency: usize,
    poll_interval: Duration,
    lease: Duration,
    shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut handles = Vec::new();

    for queue_name in registry.queues() {
        for _ in 0..worker_concurrency.max(1) {
            handles.push(tokio::spawn(worker_loop(
                queue.clone(),
                Arc::clone(&registry),
                queue_name,
                poll_interval,
                shutdown.clone(),
            )));
        }
    }

    // Lease reaper: redeliver work lost with a dead worker.
    {
        let queue = queue.clone();
        let mut shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                match queue.reap_expired(lease).await {
                    Ok(0) => {}
                    Ok(reaped) => warn!(reaped, "redelivered expired task leases"),
                    Err(err) => error!(error = %err, "lease reaper failed"),
                }
                tokio::select! {
                    _ = tokio::time::sleep(lease / 2) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            error!(error = %err, "worker task panicked");
        }
    }
}
