use serde::{Deserialize, Serialize};

/// Counters kept by the task executor across its lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutorMetrics {
    pub tasks_executed: u64,
    pub tasks_succeeded: u64,
    pub task_errors: u64,
    pub timeouts: u64,
    pub browser_crashes: u64,
    pub internal_retries: u64,
    pub pool_exhaustions: u64,
    pub rejected_closed: u64,
}

impl ExecutorMetrics {
    pub fn record_execution(&mut self) {
        self.tasks_executed = self.tasks_executed.saturating_add(1);
    }

    pub fn record_success(&mut self) {
        self.tasks_succeeded = self.tasks_succeeded.saturating_add(1);
    }

    pub fn record_task_error(&mut self) {
        self.task_errors = self.task_errors.saturating_add(1);
    }

    pub fn record_timeout(&mut self) {
        self.timeouts = self.timeouts.saturating_add(1);
    }

    pub fn record_browser_crash(&mut self) {
        self.browser_crashes = self.browser_crashes.saturating_add(1);
    }

    pub fn record_internal_retry(&mut self) {
        self.internal_retries = self.internal_retries.saturating_add(1);
    }

    pub fn record_pool_exhaustion(&mut self) {
        self.pool_exhaustions = self.pool_exhaustions.saturating_add(1);
    }

    pub fn record_rejected_closed(&mut self) {
        self.rejected_closed = self.rejected_closed.saturating_add(1);
    }

    pub fn success_rate(&self) -> f64 {
        if self.tasks_executed == 0 {
            0.0
        } else {
            (self.tasks_succeeded as f64 / self.tasks_executed as f64) * 100.0
        }
    }
}
