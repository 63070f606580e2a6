use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use scheduler_core::{
    JobDetail, JobKey, MisfireInstruction, SchedulerError, SchedulerSignaler, SimpleSchedule,
    Trigger,
};

/// 记录存储回调次数的信号接口
#[derive(Default)]
pub struct RecordingSignaler {
    pub misfires: AtomicUsize,
    pub finalized: AtomicUsize,
    pub jobs_deleted: AtomicUsize,
    pub scheduling_changes: AtomicUsize,
}

impl RecordingSignaler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn misfire_count(&self) -> usize {
        self.misfires.load(Ordering::SeqCst)
    }

    pub fn jobs_deleted_count(&self) -> usize {
        self.jobs_deleted.load(Ordering::SeqCst)
    }
}

impl SchedulerSignaler for RecordingSignaler {
    fn notify_trigger_listeners_misfired(&self, _trigger: &Trigger) {
        self.misfires.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_scheduler_listeners_finalized(&self, _trigger: &Trigger) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_scheduler_listeners_job_deleted(&self, _job_key: &JobKey) {
        self.jobs_deleted.fetch_add(1, Ordering::SeqCst);
    }

    fn signal_scheduling_change(&self, _candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        self.scheduling_changes.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_scheduler_listeners_error(&self, _message: &str, _error: &SchedulerError) {}
}

pub fn job(name: &str) -> JobDetail {
    JobDetail::builder("noop")
        .with_identity(name, "jobs")
        .build()
}

pub fn non_concurrent_job(name: &str) -> JobDetail {
    JobDetail::builder("noop")
        .with_identity(name, "jobs")
        .disallow_concurrent_execution(true)
        .build()
}

/// 只触发一次的触发器，首次触发时间已计算
pub fn once_trigger(name: &str, job: &JobDetail, start: DateTime<Utc>, priority: i32) -> Trigger {
    let mut trigger = Trigger::builder()
        .with_identity(name, "triggers")
        .for_job(job.key.clone())
        .start_at(start)
        .with_priority(priority)
        .with_schedule(SimpleSchedule::once())
        .build();
    trigger.compute_first_fire_time(None);
    trigger
}

pub fn repeating_trigger(name: &str, job: &JobDetail, start: DateTime<Utc>) -> Trigger {
    let mut trigger = Trigger::builder()
        .with_identity(name, "triggers")
        .for_job(job.key.clone())
        .start_at(start)
        .with_misfire_instruction(MisfireInstruction::SmartPolicy)
        .with_schedule(SimpleSchedule::repeat_forever(Duration::seconds(10)))
        .build();
    trigger.compute_first_fire_time(None);
    trigger
}

/// 一个足够远、不会被视为错过触发的基准时间
pub fn soon() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(30)
}

/// 十个属性各不相同的作业，用于存取一致性检查
pub fn varied_jobs() -> Vec<JobDetail> {
    (0..10)
        .map(|i| {
            let mut builder = JobDetail::builder(if i % 2 == 0 { "noop" } else { "native" })
                .with_identity(format!("job-{i}"), format!("batch-{}", i % 3))
                .using_data("index", i)
                .using_data("label", format!("第{i}个"))
                .using_data("even", i % 2 == 0)
                .store_durably(i % 2 == 0)
                .requests_recovery(i % 3 == 0)
                .disallow_concurrent_execution(i % 4 == 0)
                .persist_data_after_execution(i % 5 == 0);
            if i % 2 == 1 {
                builder = builder.with_description(format!("作业 {i}"));
            }
            builder.build()
        })
        .collect()
}
