//! Structured logging utilities
//!
//! Event-tagged records for the trigger lifecycle, job executions,
//! recovery and lock handling.

use chrono::{DateTime, Utc};
use scheduler_core::{CompletedExecutionInstruction, JobKey, TriggerKey};
use tracing::{debug, error, info, warn};

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    /// Log trigger acquisition
    pub fn log_trigger_acquired(
        trigger_key: &TriggerKey,
        fire_instance_id: &str,
        next_fire_time: Option<DateTime<Utc>>,
    ) {
        debug!(
            event = "trigger_acquired",
            trigger.key = %trigger_key,
            trigger.fire_instance_id = fire_instance_id,
            trigger.next_fire_time = ?next_fire_time,
            "Trigger acquired"
        );
    }

    /// Log trigger firing
    pub fn log_trigger_fired(
        trigger_key: &TriggerKey,
        job_key: &JobKey,
        fire_instance_id: &str,
        scheduled_fire_time: Option<DateTime<Utc>>,
        next_fire_time: Option<DateTime<Utc>>,
    ) {
        info!(
            event = "trigger_fired",
            trigger.key = %trigger_key,
            job.key = %job_key,
            trigger.fire_instance_id = fire_instance_id,
            trigger.scheduled_fire_time = ?scheduled_fire_time,
            trigger.next_fire_time = ?next_fire_time,
            "Trigger fired"
        );
    }

    /// Log misfire handling
    pub fn log_trigger_misfired(
        trigger_key: &TriggerKey,
        missed_fire_time: Option<DateTime<Utc>>,
        new_next_fire_time: Option<DateTime<Utc>>,
    ) {
        warn!(
            event = "trigger_misfired",
            trigger.key = %trigger_key,
            trigger.missed_fire_time = ?missed_fire_time,
            trigger.next_fire_time = ?new_next_fire_time,
            "Trigger misfired"
        );
    }

    /// Log job execution start
    pub fn log_job_execution_start(
        job_key: &JobKey,
        trigger_key: &TriggerKey,
        fire_instance_id: &str,
        refire_count: u32,
    ) {
        debug!(
            event = "job_execution_start",
            job.key = %job_key,
            trigger.key = %trigger_key,
            trigger.fire_instance_id = fire_instance_id,
            job.refire_count = refire_count,
            "Job execution started"
        );
    }

    /// Log job execution completion
    pub fn log_job_execution_complete(
        job_key: &JobKey,
        trigger_key: &TriggerKey,
        fire_instance_id: &str,
        duration_ms: u64,
        instruction: CompletedExecutionInstruction,
        error_message: Option<&str>,
    ) {
        match error_message {
            None => info!(
                event = "job_execution_complete",
                job.key = %job_key,
                trigger.key = %trigger_key,
                trigger.fire_instance_id = fire_instance_id,
                job.duration_ms = duration_ms,
                trigger.instruction = %instruction,
                job.success = true,
                "Job execution completed"
            ),
            Some(message) => error!(
                event = "job_execution_failed",
                job.key = %job_key,
                trigger.key = %trigger_key,
                trigger.fire_instance_id = fire_instance_id,
                job.duration_ms = duration_ms,
                trigger.instruction = %instruction,
                job.success = false,
                job.error = message,
                "Job execution failed"
            ),
        }
    }

    /// Log creation of a recovery trigger for an interrupted execution
    pub fn log_trigger_recovered(
        original_trigger_key: &TriggerKey,
        job_key: &JobKey,
        recovery_trigger_key: &TriggerKey,
        failed_instance_id: &str,
    ) {
        info!(
            event = "trigger_recovered",
            trigger.key = %original_trigger_key,
            job.key = %job_key,
            recovery.trigger_key = %recovery_trigger_key,
            recovery.instance_id = failed_instance_id,
            "Recovery trigger scheduled"
        );
    }

    /// Log lock contention while obtaining a store lock
    pub fn log_lock_contention(lock_name: &str, attempt: u32, max_attempts: u32, reason: &str) {
        warn!(
            event = "lock_contention",
            lock.name = lock_name,
            lock.attempt = attempt,
            lock.max_attempts = max_attempts,
            lock.reason = reason,
            "Lock contention"
        );
    }

    /// Log detection of a failed cluster instance
    pub fn log_cluster_instance_failed(
        instance_id: &str,
        last_checkin: DateTime<Utc>,
        checkin_interval_ms: i64,
    ) {
        warn!(
            event = "cluster_instance_failed",
            cluster.instance_id = instance_id,
            cluster.last_checkin = %last_checkin,
            cluster.checkin_interval_ms = checkin_interval_ms,
            "Cluster instance missed check-in"
        );
    }

    /// Log scheduler lifecycle transitions
    pub fn log_scheduler_lifecycle(scheduler_name: &str, instance_id: &str, phase: &str) {
        info!(
            event = "scheduler_lifecycle",
            scheduler.name = scheduler_name,
            scheduler.instance_id = instance_id,
            scheduler.phase = phase,
            "Scheduler {}",
            phase
        );
    }
}
