use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Notify;

use crate::calendar::Calendar;
use crate::errors::JobExecutionError;
use crate::models::{
    JobDataMap, JobDetail, Trigger, TriggerFiredBundle, TriggerKey,
    FAILED_JOB_ORIGINAL_TRIGGER_GROUP, FAILED_JOB_ORIGINAL_TRIGGER_NAME,
};
use crate::traits::Scheduler;
use crate::SchedulerResult;

/// 可调度的工作单元
#[async_trait]
pub trait Job: Send + Sync {
    /// 执行作业；对 `job_data_map_mut` 的修改在作业声明持久化时会写回存储
    async fn execute(&self, context: &mut JobExecutionContext) -> Result<(), JobExecutionError>;
}

/// 根据作业类型和数据构造作业实例
pub trait JobFactory: Send + Sync {
    fn new_job(&self, job_type: &str, data: &JobDataMap) -> SchedulerResult<Box<dyn Job>>;
}

/// 作业可轮询或等待的中断标志，中断仅为建议性
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle {
    inner: Arc<InterruptState>,
}

#[derive(Debug, Default)]
struct InterruptState {
    interrupted: AtomicBool,
    notify: Notify,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// 等待直到被中断
    pub async fn interrupted(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_interrupted() {
            return;
        }
        notified.await;
    }
}

/// 作业一次执行的上下文
pub struct JobExecutionContext {
    scheduler: Arc<dyn Scheduler>,
    job_detail: JobDetail,
    trigger: Trigger,
    calendar: Option<Calendar>,
    recovering: bool,
    fire_time: DateTime<Utc>,
    scheduled_fire_time: Option<DateTime<Utc>>,
    previous_fire_time: Option<DateTime<Utc>>,
    next_fire_time: Option<DateTime<Utc>>,
    fire_instance_id: String,
    refire_count: u32,
    job_data_map: JobDataMap,
    merged_job_data_map: JobDataMap,
    result: Option<Value>,
    interrupt: InterruptHandle,
}

impl JobExecutionContext {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        bundle: &TriggerFiredBundle,
        interrupt: InterruptHandle,
    ) -> Self {
        let job_data_map = bundle.job_detail.data_map.clone();
        let mut merged_job_data_map = job_data_map.clone();
        merged_job_data_map.merge(&bundle.trigger.data_map);

        Self {
            scheduler,
            job_detail: bundle.job_detail.clone(),
            trigger: bundle.trigger.clone(),
            calendar: bundle.calendar.clone(),
            recovering: bundle.recovering,
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.next_fire_time,
            fire_instance_id: bundle.trigger.fire_instance_id.clone().unwrap_or_default(),
            refire_count: 0,
            job_data_map,
            merged_job_data_map,
            result: None,
            interrupt,
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn job_detail(&self) -> &JobDetail {
        &self.job_detail
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn calendar(&self) -> Option<&Calendar> {
        self.calendar.as_ref()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// 恢复执行时返回崩溃前的原触发器
    pub fn recovering_trigger_key(&self) -> Option<TriggerKey> {
        if !self.recovering {
            return None;
        }
        let data = &self.trigger.data_map;
        let name = data.get_str(FAILED_JOB_ORIGINAL_TRIGGER_NAME)?;
        let group = data.get_str(FAILED_JOB_ORIGINAL_TRIGGER_GROUP)?;
        Some(TriggerKey::new(name, group))
    }

    pub fn fire_time(&self) -> DateTime<Utc> {
        self.fire_time
    }

    pub fn scheduled_fire_time(&self) -> Option<DateTime<Utc>> {
        self.scheduled_fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.previous_fire_time
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.next_fire_time
    }

    pub fn fire_instance_id(&self) -> &str {
        &self.fire_instance_id
    }

    pub fn refire_count(&self) -> u32 {
        self.refire_count
    }

    pub fn increment_refire_count(&mut self) {
        self.refire_count += 1;
    }

    /// 作业自身的数据（可修改的快照）
    pub fn job_data_map(&self) -> &JobDataMap {
        &self.job_data_map
    }

    pub fn job_data_map_mut(&mut self) -> &mut JobDataMap {
        &mut self.job_data_map
    }

    /// 作业数据与触发器数据合并后的只读视图，同名键以触发器为准
    pub fn merged_job_data_map(&self) -> &JobDataMap {
        &self.merged_job_data_map
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn set_result(&mut self, result: impl Into<Value>) {
        self.result = Some(result.into());
    }

    pub fn interrupt_handle(&self) -> &InterruptHandle {
        &self.interrupt
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }
}

impl std::fmt::Debug for JobExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutionContext")
            .field("job", &self.job_detail.key)
            .field("trigger", &self.trigger.key)
            .field("fire_instance_id", &self.fire_instance_id)
            .field("fire_time", &self.fire_time)
            .field("recovering", &self.recovering)
            .field("refire_count", &self.refire_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_interrupt_wakes_waiter() {
        let handle = InterruptHandle::new();
        let waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.interrupted().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_interrupted());
        handle.interrupt();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(handle.is_interrupted());
    }

    #[tokio::test]
    async fn test_already_interrupted_returns_immediately() {
        let handle = InterruptHandle::new();
        handle.interrupt();
        tokio::time::timeout(Duration::from_millis(100), handle.interrupted())
            .await
            .expect("should not block");
    }
}
