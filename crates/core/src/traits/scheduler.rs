use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::models::{
    GroupMatcher, JobDataMap, JobDetail, JobKey, Trigger, TriggerKey, TriggerState,
};
use crate::SchedulerResult;

/// 调度器运行概况
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerMetaData {
    pub scheduler_name: String,
    pub instance_id: String,
    pub started: bool,
    pub in_standby_mode: bool,
    pub shutdown: bool,
    pub running_since: Option<DateTime<Utc>>,
    pub number_of_jobs_executed: u64,
    pub job_store: String,
    pub job_store_supports_persistence: bool,
    pub job_store_clustered: bool,
    pub thread_pool_size: usize,
}

/// 正在执行的作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutingJob {
    pub fire_instance_id: String,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub recovering: bool,
}

/// 调度器对外接口
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn scheduler_name(&self) -> &str;

    fn scheduler_instance_id(&self) -> &str;

    // ---- 生命周期 ----

    async fn start(&self) -> SchedulerResult<()>;

    async fn start_delayed(&self, delay: std::time::Duration) -> SchedulerResult<()>;

    /// 暂停触发（不影响正在执行的作业），可再次 start
    async fn standby(&self) -> SchedulerResult<()>;

    fn is_started(&self) -> bool;

    fn is_in_standby_mode(&self) -> bool;

    fn is_shutdown(&self) -> bool;

    async fn shutdown(&self, wait_for_jobs_to_complete: bool) -> SchedulerResult<()>;

    async fn metadata(&self) -> SchedulerResult<SchedulerMetaData>;

    async fn currently_executing_jobs(&self) -> Vec<ExecutingJob>;

    // ---- 调度 ----

    /// 存储作业并用触发器调度，返回首次触发时间
    async fn schedule_job(&self, job: &JobDetail, trigger: &Trigger)
        -> SchedulerResult<DateTime<Utc>>;

    /// 为已存在的作业添加触发器
    async fn schedule_trigger(&self, trigger: &Trigger) -> SchedulerResult<DateTime<Utc>>;

    async fn schedule_jobs(
        &self,
        jobs: &[(JobDetail, Vec<Trigger>)],
        replace: bool,
    ) -> SchedulerResult<()>;

    async fn unschedule_job(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool>;

    async fn unschedule_jobs(&self, trigger_keys: &[TriggerKey]) -> SchedulerResult<bool>;

    /// 用新触发器替换旧触发器，返回新的首次触发时间；旧触发器不存在时返回 None
    async fn reschedule_job(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<Option<DateTime<Utc>>>;

    /// 添加没有触发器的作业，必须是持久作业
    async fn add_job(&self, job: &JobDetail, replace: bool) -> SchedulerResult<()>;

    async fn delete_job(&self, job_key: &JobKey) -> SchedulerResult<bool>;

    async fn delete_jobs(&self, job_keys: &[JobKey]) -> SchedulerResult<bool>;

    /// 立即触发一次作业
    async fn trigger_job(&self, job_key: &JobKey, data: Option<JobDataMap>) -> SchedulerResult<()>;

    // ---- 暂停与恢复 ----

    async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()>;

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<()>;

    async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()>;

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<()>;

    async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()>;

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<()>;

    async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()>;

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<()>;

    async fn pause_all(&self) -> SchedulerResult<()>;

    async fn resume_all(&self) -> SchedulerResult<()>;

    async fn get_paused_trigger_groups(&self) -> SchedulerResult<BTreeSet<String>>;

    // ---- 查询 ----

    async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>>;

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> SchedulerResult<BTreeSet<JobKey>>;

    async fn get_triggers_of_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>>;

    async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>>;

    async fn get_trigger_keys(&self, matcher: &GroupMatcher)
        -> SchedulerResult<BTreeSet<TriggerKey>>;

    async fn get_job_detail(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>>;

    async fn get_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>>;

    async fn get_trigger_state(&self, trigger_key: &TriggerKey) -> SchedulerResult<TriggerState>;

    async fn reset_trigger_from_error_state(&self, trigger_key: &TriggerKey)
        -> SchedulerResult<()>;

    async fn check_job_exists(&self, job_key: &JobKey) -> SchedulerResult<bool>;

    async fn check_trigger_exists(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool>;

    // ---- 日历 ----

    async fn add_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()>;

    async fn delete_calendar(&self, name: &str) -> SchedulerResult<bool>;

    async fn get_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>>;

    async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>>;

    /// 清空所有作业、触发器和日历
    async fn clear(&self) -> SchedulerResult<()>;

    // ---- 中断 ----

    /// 请求中断该作业所有正在执行的实例，返回是否有实例被通知
    async fn interrupt(&self, job_key: &JobKey) -> SchedulerResult<bool>;

    async fn interrupt_instance(&self, fire_instance_id: &str) -> SchedulerResult<bool>;
}
