use chrono::{DateTime, Utc};

use crate::models::{JobKey, Trigger};
use crate::SchedulerError;

/// 存储回调调度器的接口
pub trait SchedulerSignaler: Send + Sync {
    fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);

    fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

    fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey);

    /// 某个触发器的下次触发时间可能提前了；`None` 表示未知
    fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>);

    fn notify_scheduler_listeners_error(&self, message: &str, error: &SchedulerError);
}

/// 存储尚未初始化时使用的空实现
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignaler;

impl SchedulerSignaler for NoopSignaler {
    fn notify_trigger_listeners_misfired(&self, _trigger: &Trigger) {}

    fn notify_scheduler_listeners_finalized(&self, _trigger: &Trigger) {}

    fn notify_scheduler_listeners_job_deleted(&self, _job_key: &JobKey) {}

    fn signal_scheduling_change(&self, _candidate_new_next_fire_time: Option<DateTime<Utc>>) {}

    fn notify_scheduler_listeners_error(&self, _message: &str, _error: &SchedulerError) {}
}
