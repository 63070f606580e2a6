use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::calendar::Calendar;
use crate::models::{
    CompletedExecutionInstruction, FiredTriggerRecord, GroupMatcher, JobDetail, JobKey, Trigger,
    TriggerFiredResult, TriggerKey, TriggerState,
};
use crate::traits::SchedulerSignaler;
use crate::SchedulerResult;

/// 作业存储接口
///
/// 存储持有作业、触发器、日历和触发记录的权威副本，调用方拿到的都是克隆。
/// 获取/释放/触发/完成四个操作构成调度协议：
///
/// 1. [`acquire_next_triggers`](JobStore::acquire_next_triggers) 按
///    (下次触发时间, 优先级降序, 键) 取出即将触发的触发器并标记为已获取
/// 2. [`release_acquired_trigger`](JobStore::release_acquired_trigger) 放弃未触发的获取
/// 3. [`triggers_fired`](JobStore::triggers_fired) 推进调度并生成执行快照
/// 4. [`triggered_job_complete`](JobStore::triggered_job_complete) 按执行结果更新触发器
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 调度器创建时调用，注入回调接口
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> SchedulerResult<()>;

    /// 调度器启动时调用，负责崩溃恢复
    async fn scheduler_started(&self) -> SchedulerResult<()>;

    async fn scheduler_paused(&self) -> SchedulerResult<()> {
        Ok(())
    }

    async fn scheduler_resumed(&self) -> SchedulerResult<()> {
        Ok(())
    }

    async fn shutdown(&self) -> SchedulerResult<()>;

    fn supports_persistence(&self) -> bool;

    fn is_clustered(&self) -> bool {
        false
    }

    /// 释放并重新获取一个触发器的大致耗时，用于判断是否值得让位给更早的触发器
    fn estimated_time_to_release_and_acquire_trigger(&self) -> Duration;

    // ---- 作业 ----

    async fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger)
        -> SchedulerResult<()>;

    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> SchedulerResult<()>;

    async fn store_jobs_and_triggers(
        &self,
        jobs: &[(JobDetail, Vec<Trigger>)],
        replace: bool,
    ) -> SchedulerResult<()>;

    /// 删除作业及其全部触发器
    async fn remove_job(&self, job_key: &JobKey) -> SchedulerResult<bool>;

    async fn remove_jobs(&self, job_keys: &[JobKey]) -> SchedulerResult<bool> {
        let mut all_found = true;
        for key in job_keys {
            all_found = self.remove_job(key).await? && all_found;
        }
        Ok(all_found)
    }

    async fn retrieve_job(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>>;

    async fn check_job_exists(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        Ok(self.retrieve_job(job_key).await?.is_some())
    }

    // ---- 触发器 ----

    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> SchedulerResult<()>;

    /// 删除触发器；非持久作业失去最后一个触发器时一并删除
    async fn remove_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool>;

    async fn remove_triggers(&self, trigger_keys: &[TriggerKey]) -> SchedulerResult<bool> {
        let mut all_found = true;
        for key in trigger_keys {
            all_found = self.remove_trigger(key).await? && all_found;
        }
        Ok(all_found)
    }

    /// 用新触发器替换旧触发器，新触发器必须指向同一作业
    async fn replace_trigger(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool>;

    async fn retrieve_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>>;

    async fn check_trigger_exists(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        Ok(self.retrieve_trigger(trigger_key).await?.is_some())
    }

    async fn get_trigger_state(&self, trigger_key: &TriggerKey) -> SchedulerResult<TriggerState>;

    /// 将 ERROR 状态的触发器恢复为 NORMAL（或所在分组暂停时为 PAUSED）
    async fn reset_trigger_from_error_state(&self, trigger_key: &TriggerKey)
        -> SchedulerResult<()>;

    async fn get_triggers_for_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>>;

    async fn clear_all_scheduling_data(&self) -> SchedulerResult<()>;

    // ---- 日历 ----

    /// 存储日历；`update_triggers` 时重新计算引用它的触发器
    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()>;

    /// 仍有触发器引用时拒绝删除
    async fn remove_calendar(&self, name: &str) -> SchedulerResult<bool>;

    async fn retrieve_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>>;

    async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>>;

    // ---- 枚举 ----

    async fn get_number_of_jobs(&self) -> SchedulerResult<usize>;

    async fn get_number_of_triggers(&self) -> SchedulerResult<usize>;

    async fn get_number_of_calendars(&self) -> SchedulerResult<usize>;

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> SchedulerResult<BTreeSet<JobKey>>;

    async fn get_trigger_keys(&self, matcher: &GroupMatcher)
        -> SchedulerResult<BTreeSet<TriggerKey>>;

    async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>>;

    async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>>;

    // ---- 暂停与恢复 ----

    async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()>;

    /// 返回被暂停的分组名；精确匹配时即使分组当前为空也会记住
    async fn pause_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>>;

    async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()>;

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>>;

    /// 恢复触发器，期间错过的触发按策略处理
    async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()>;

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>>;

    async fn get_paused_trigger_groups(&self) -> SchedulerResult<BTreeSet<String>>;

    async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()>;

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>>;

    async fn pause_all(&self) -> SchedulerResult<()>;

    async fn resume_all(&self) -> SchedulerResult<()>;

    // ---- 调度协议 ----

    /// 获取下次触发时间不晚于 `no_later_than + time_window` 的至多 `max_count` 个触发器
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>>;

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()>;

    /// 结果与输入一一对应
    async fn triggers_fired(&self, triggers: &[Trigger]) -> SchedulerResult<Vec<TriggerFiredResult>>;

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()>;

    /// 当前所有触发记录
    async fn get_fired_trigger_records(&self) -> SchedulerResult<Vec<FiredTriggerRecord>>;
}
