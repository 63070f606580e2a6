//! Metrics collector for the job scheduler
//!
//! Handles are registered through the `metrics` facade; values are only
//! exported when the embedding application installs a recorder.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

/// Metrics collector for the job scheduler
#[derive(Clone)]
pub struct MetricsCollector {
    // Trigger lifecycle metrics
    triggers_acquired_total: Counter,
    triggers_released_total: Counter,
    triggers_fired_total: Counter,
    misfires_total: Counter,

    // Job execution metrics
    job_executions_total: Counter,
    job_failures_total: Counter,
    job_vetoes_total: Counter,
    job_execution_duration: Histogram,
    busy_workers: Gauge,

    // Store metrics
    lock_retries_total: Counter,
    recovered_jobs_total: Counter,
    store_operation_duration: Histogram,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            triggers_acquired_total: counter!("scheduler_triggers_acquired_total"),
            triggers_released_total: counter!("scheduler_triggers_released_total"),
            triggers_fired_total: counter!("scheduler_triggers_fired_total"),
            misfires_total: counter!("scheduler_misfires_total"),
            job_executions_total: counter!("scheduler_job_executions_total"),
            job_failures_total: counter!("scheduler_job_failures_total"),
            job_vetoes_total: counter!("scheduler_job_vetoes_total"),
            job_execution_duration: histogram!("scheduler_job_execution_duration_seconds"),
            busy_workers: gauge!("scheduler_busy_workers"),
            lock_retries_total: counter!("scheduler_lock_retries_total"),
            recovered_jobs_total: counter!("scheduler_recovered_jobs_total"),
            store_operation_duration: histogram!("scheduler_store_operation_duration_seconds"),
        }
    }

    pub fn record_triggers_acquired(&self, count: usize) {
        self.triggers_acquired_total.increment(count as u64);
    }

    pub fn record_trigger_released(&self) {
        self.triggers_released_total.increment(1);
    }

    pub fn record_trigger_fired(&self) {
        self.triggers_fired_total.increment(1);
    }

    pub fn record_misfire(&self) {
        self.misfires_total.increment(1);
    }

    /// Record a finished job execution
    pub fn record_job_execution(&self, success: bool, duration_seconds: f64) {
        self.job_executions_total.increment(1);
        if !success {
            self.job_failures_total.increment(1);
        }
        self.job_execution_duration.record(duration_seconds);
    }

    pub fn record_job_vetoed(&self) {
        self.job_vetoes_total.increment(1);
    }

    pub fn update_busy_workers(&self, busy: usize) {
        self.busy_workers.set(busy as f64);
    }

    pub fn record_lock_retry(&self) {
        self.lock_retries_total.increment(1);
    }

    pub fn record_recovered_jobs(&self, count: usize) {
        self.recovered_jobs_total.increment(count as u64);
    }

    pub fn record_store_operation(&self, duration_seconds: f64) {
        self.store_operation_duration.record(duration_seconds);
    }
}
