use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::config::TaskSection;
use crate::metrics::ExecutorMetrics;
use crate::pool::{PoolError, SessionPool};
use crate::task::{Task, TaskPayload};

/// What one `execute` call produced. Serializable so the front end can map
/// each variant onto an HTTP status.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success(TaskPayload),
    Timeout,
    BrowserCrashed { message: String },
    TaskError { message: String },
}

/// Capacity failures stay distinguishable from task outcomes: the caller
/// may retry after backoff on `PoolExhausted`, while `PoolClosed` is fatal
/// for the call.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("pool exhausted: no session became available within the wait budget")]
    PoolExhausted,
    #[error("executor is shut down")]
    PoolClosed,
}

/// Runs tasks against pooled browser sessions under hard deadlines.
///
/// Concurrency is bounded by the pool cap; the executor adds deadline
/// enforcement, outcome classification, and a single internal retry for
/// crashed sessions.
pub struct TaskExecutor {
    pool: Arc<SessionPool>,
    config: TaskSection,
    metrics: Arc<Mutex<ExecutorMetrics>>,
}

impl TaskExecutor {
    pub fn new(pool: Arc<SessionPool>, config: TaskSection) -> Self {
        Self {
            pool,
            config,
            metrics: Arc::new(Mutex::new(ExecutorMetrics::default())),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn metrics(&self) -> ExecutorMetrics {
        self.metrics
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn with_metrics<F: FnOnce(&mut ExecutorMetrics)>(&self, f: F) {
        if let Ok(mut guard) = self.metrics.lock() {
            f(&mut guard);
        }
    }

    /// How long this task may wait for a session: remaining deadline minus
    /// the safety margin, capped by the pool's acquire ceiling.
    fn acquire_budget(&self, task: &Task) -> Duration {
        let remaining = task.remaining(Instant::now());
        remaining
            .saturating_sub(self.config.acquire_safety_margin())
            .min(self.pool.config().acquire_timeout())
    }

    /// Run one task to completion. Exactly one session release happens per
    /// acquired session, on every path.
    pub async fn execute(&self, task: Task) -> Result<Outcome, ExecutorError> {
        self.with_metrics(|m| m.record_execution());

        if task.deadline() <= Instant::now() {
            debug!(task_id = %task.id(), "task deadline already passed; nothing attempted");
            self.with_metrics(|m| m.record_timeout());
            return Ok(Outcome::Timeout);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let budget = self.acquire_budget(&task);
            let mut lease = match self.pool.acquire(budget).await {
                Ok(lease) => lease,
                Err(PoolError::Closed) => {
                    self.with_metrics(|m| m.record_rejected_closed());
                    return Err(ExecutorError::PoolClosed);
                }
                Err(PoolError::Exhausted { waited_ms }) => {
                    info!(task_id = %task.id(), waited_ms, "no session available within wait budget");
                    self.with_metrics(|m| m.record_pool_exhaustion());
                    return Err(ExecutorError::PoolExhausted);
                }
                Err(PoolError::Launch(err)) => {
                    warn!(task_id = %task.id(), error = %err, attempt, "session launch failed");
                    if attempt == 1 && task.deadline() > Instant::now() {
                        self.with_metrics(|m| m.record_internal_retry());
                        continue;
                    }
                    self.with_metrics(|m| m.record_browser_crash());
                    return Ok(Outcome::BrowserCrashed {
                        message: err.to_string(),
                    });
                }
            };

            debug!(
                task_id = %task.id(),
                session_id = ?lease.session_id(),
                priority = task.priority(),
                attempt,
                "running task on session"
            );

            match timeout_at(task.deadline(), lease.run(task.spec())).await {
                Err(_elapsed) => {
                    // The in-flight action was cancelled by dropping its
                    // future; the session state is unknown, so discard it.
                    info!(task_id = %task.id(), "task deadline elapsed mid-run; discarding session");
                    lease.release(false).await;
                    self.with_metrics(|m| m.record_timeout());
                    return Ok(Outcome::Timeout);
                }
                Ok(Ok(payload)) => {
                    lease.record_success();
                    lease.release(true).await;
                    self.with_metrics(|m| m.record_success());
                    return Ok(Outcome::Success(payload));
                }
                Ok(Err(err)) if err.is_fatal() => {
                    warn!(
                        task_id = %task.id(),
                        session_id = ?lease.session_id(),
                        error = %err,
                        attempt,
                        "browser session failed mid-task"
                    );
                    lease.release(false).await;
                    if attempt == 1 && task.deadline() > Instant::now() {
                        self.with_metrics(|m| m.record_internal_retry());
                        continue;
                    }
                    self.with_metrics(|m| m.record_browser_crash());
                    return Ok(Outcome::BrowserCrashed {
                        message: err.to_string(),
                    });
                }
                Ok(Err(err)) => {
                    // Application-level failure: the browser is fine, the
                    // task is not. The failure counter decides whether the
                    // pool keeps recycling this session.
                    debug!(task_id = %task.id(), error = %err, "task failed at action level");
                    lease.record_failure();
                    lease.release(true).await;
                    self.with_metrics(|m| m.record_task_error());
                    return Ok(Outcome::TaskError {
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Stop accepting tasks and tear the pool down, honoring the grace
    /// period for in-flight work.
    pub async fn shutdown(&self, grace: Duration) {
        self.pool.shutdown(grace).await;
    }
}
