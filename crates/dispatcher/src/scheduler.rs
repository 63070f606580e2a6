use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::config::SchedulerSection;
use scheduler_core::{
    Calendar, CompletedExecutionInstruction, ExecutingJob, GroupMatcher, InterruptHandle,
    JobDataMap, JobDetail, JobExecutionContext, JobExecutionError, JobFactory, JobKey,
    JobListener, JobStore, Matcher, Scheduler, SchedulerError, SchedulerListener, SchedulerMetaData,
    SchedulerResult, SchedulerSignaler, SimpleSchedule, Trigger, TriggerKey, TriggerListener,
    TriggerState,
};
use scheduler_infrastructure::StructuredLogger;
use scheduler_worker::{RunShellHost, WorkerPool};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::listener_manager::ListenerManager;
use crate::scheduler_loop::SchedulerLoop;
use crate::signal::SchedulingSignal;

/// `trigger_job` 生成的一次性触发器所在分组
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

/// 构造调度器所需的资源
pub struct SchedulerResources {
    pub name: String,
    pub instance_id: String,
    pub config: SchedulerSection,
    pub job_store_name: String,
    pub job_store: Arc<dyn JobStore>,
    pub job_factory: Arc<dyn JobFactory>,
    pub thread_count: usize,
}

/// 标准调度器
///
/// 对外实现 [`Scheduler`]，内部驱动一个调度循环，把到期的触发器交给工作池执行。
pub struct StdScheduler {
    name: String,
    instance_id: String,
    config: SchedulerSection,
    job_store_name: String,
    store: Arc<dyn JobStore>,
    job_factory: Arc<dyn JobFactory>,
    pool: Arc<WorkerPool>,
    listeners: ListenerManager,
    signal: Arc<SchedulingSignal>,
    started_once: AtomicBool,
    standby: AtomicBool,
    shutting_down: AtomicBool,
    shut_down: AtomicBool,
    running_since: StdMutex<Option<DateTime<Utc>>>,
    jobs_executed: AtomicU64,
    executing: StdMutex<HashMap<String, (ExecutingJob, InterruptHandle)>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<StdScheduler>,
}

impl std::fmt::Debug for StdScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdScheduler")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

/// 存储回调调度器的适配器，只持有弱引用
struct StoreSignaler {
    scheduler: Weak<StdScheduler>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StdScheduler {
    pub fn new(resources: SchedulerResources) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            name: resources.name,
            instance_id: resources.instance_id,
            config: resources.config,
            job_store_name: resources.job_store_name,
            store: resources.job_store,
            job_factory: resources.job_factory,
            pool: Arc::new(WorkerPool::new(resources.thread_count)),
            listeners: ListenerManager::new(),
            signal: Arc::new(SchedulingSignal::new()),
            started_once: AtomicBool::new(false),
            standby: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            running_since: StdMutex::new(None),
            jobs_executed: AtomicU64::new(0),
            executing: StdMutex::new(HashMap::new()),
            loop_handle: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    /// 把调度器注册为存储的回调对象，必须在 `start` 之前调用一次
    pub async fn initialize(&self) -> SchedulerResult<()> {
        let signaler: Arc<dyn SchedulerSignaler> = Arc::new(StoreSignaler {
            scheduler: self.self_ref.clone(),
        });
        self.store.initialize(signaler).await?;
        info!(
            "调度器 {} 初始化完成，实例 {}，存储 {}，工作池 {}",
            self.name,
            self.instance_id,
            self.job_store_name,
            self.pool.pool_size()
        );
        Ok(())
    }

    pub fn listener_manager(&self) -> &ListenerManager {
        &self.listeners
    }

    pub fn add_job_listener(
        &self,
        listener: Arc<dyn JobListener>,
        matchers: Vec<Matcher<JobKey>>,
    ) {
        self.listeners.add_job_listener(listener, matchers);
    }

    pub fn add_trigger_listener(
        &self,
        listener: Arc<dyn TriggerListener>,
        matchers: Vec<Matcher<TriggerKey>>,
    ) {
        self.listeners.add_trigger_listener(listener, matchers);
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.listeners.add_scheduler_listener(listener);
    }

    pub fn job_store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn config(&self) -> &SchedulerSection {
        &self.config
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub(crate) fn signal(&self) -> &Arc<SchedulingSignal> {
        &self.signal
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.standby.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> SchedulerResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) || self.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::SchedulerShutdown);
        }
        Ok(())
    }

    fn signal_scheduling_change(&self, candidate: Option<DateTime<Utc>>) {
        self.signal.signal(candidate);
    }

    /// 校验触发器并计算首次触发时间
    async fn prepare_trigger(&self, trigger: &Trigger) -> SchedulerResult<Trigger> {
        trigger.validate()?;
        let mut trigger = trigger.clone();
        let calendar = match &trigger.calendar_name {
            Some(name) => Some(
                self.store
                    .retrieve_calendar(name)
                    .await?
                    .ok_or_else(|| SchedulerError::CalendarNotFound(name.clone()))?,
            ),
            None => None,
        };
        if trigger.compute_first_fire_time(calendar.as_ref()).is_none() {
            return Err(SchedulerError::InvalidSchedule(format!(
                "触发器 {} 永远不会触发",
                trigger.key
            )));
        }
        Ok(trigger)
    }

    /// 注册时尽早发现无法实例化的作业
    fn check_job_instantiable(&self, job: &JobDetail) -> SchedulerResult<()> {
        job.validate()?;
        self.job_factory
            .new_job(&job.job_type, &job.data_map)
            .map(|_| ())
    }

    // ---- 监听器通知，单个监听器的错误只记录不传播 ----

    fn notify_scheduler_listeners(&self, notify: impl Fn(&dyn SchedulerListener)) {
        for listener in self.listeners.scheduler_listeners() {
            notify(listener.as_ref());
        }
    }

    fn notify_job_listeners(
        &self,
        job_key: &JobKey,
        event: &str,
        notify: impl Fn(&dyn JobListener) -> SchedulerResult<()>,
    ) {
        for listener in self.listeners.job_listeners_for(job_key) {
            if let Err(e) = notify(listener.as_ref()) {
                let message = format!("作业监听器 {} 处理 {} 失败", listener.name(), event);
                error!("{}: {}", message, e);
                self.notify_error(&message, &e);
            }
        }
    }

    fn notify_trigger_listeners(
        &self,
        trigger_key: &TriggerKey,
        event: &str,
        notify: impl Fn(&dyn TriggerListener) -> SchedulerResult<()>,
    ) {
        for listener in self.listeners.trigger_listeners_for(trigger_key) {
            if let Err(e) = notify(listener.as_ref()) {
                let message = format!("触发器监听器 {} 处理 {} 失败", listener.name(), event);
                error!("{}: {}", message, e);
                self.notify_error(&message, &e);
            }
        }
    }

    pub(crate) fn notify_error(&self, message: &str, error: &SchedulerError) {
        self.notify_scheduler_listeners(|l| l.scheduler_error(message, error));
    }

    fn notify_misfired(&self, trigger: &Trigger) {
        self.notify_trigger_listeners(&trigger.key, "trigger_misfired", |l| {
            l.trigger_misfired(trigger)
        });
    }

    fn notify_finalized(&self, trigger: &Trigger) {
        self.notify_scheduler_listeners(|l| l.trigger_finalized(trigger));
    }

    async fn stop_loop(&self) {
        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            self.signal.signal(None);
            if let Err(e) = handle.await {
                warn!("调度循环异常退出: {}", e);
            }
        }
    }
}

#[async_trait]
impl Scheduler for StdScheduler {
    fn scheduler_name(&self) -> &str {
        &self.name
    }

    fn scheduler_instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn start(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.notify_scheduler_listeners(|l| l.scheduler_starting());

        if !self.started_once.load(Ordering::SeqCst) {
            self.store.scheduler_started().await?;
            let scheduler = self.self_ref.upgrade().ok_or_else(|| {
                SchedulerError::Internal("调度器已被释放".to_string())
            })?;
            let handle = tokio::spawn(SchedulerLoop::new(scheduler).run());
            *self.loop_handle.lock().await = Some(handle);
            *lock(&self.running_since) = Some(Utc::now());
            self.started_once.store(true, Ordering::SeqCst);
        } else {
            self.store.scheduler_resumed().await?;
        }

        self.standby.store(false, Ordering::SeqCst);
        self.signal_scheduling_change(None);
        StructuredLogger::log_scheduler_lifecycle(&self.name, &self.instance_id, "started");
        self.notify_scheduler_listeners(|l| l.scheduler_started());
        Ok(())
    }

    async fn start_delayed(&self, delay: Duration) -> SchedulerResult<()> {
        self.ensure_running()?;
        let scheduler = self.self_ref.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                if let Err(e) = scheduler.start().await {
                    error!("延迟启动调度器失败: {}", e);
                }
            }
        });
        Ok(())
    }

    async fn standby(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.scheduler_paused().await?;
        self.standby.store(true, Ordering::SeqCst);
        self.signal_scheduling_change(None);
        StructuredLogger::log_scheduler_lifecycle(&self.name, &self.instance_id, "standby");
        self.notify_scheduler_listeners(|l| l.scheduler_in_standby());
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started_once.load(Ordering::SeqCst)
            && !self.standby.load(Ordering::SeqCst)
            && !self.shutting_down.load(Ordering::SeqCst)
    }

    fn is_in_standby_mode(&self) -> bool {
        self.standby.load(Ordering::SeqCst)
    }

    fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    async fn shutdown(&self, wait_for_jobs_to_complete: bool) -> SchedulerResult<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(
            "调度器 {} 正在关闭，等待作业完成: {}",
            self.name, wait_for_jobs_to_complete
        );
        StructuredLogger::log_scheduler_lifecycle(&self.name, &self.instance_id, "shutting_down");
        self.notify_scheduler_listeners(|l| l.scheduler_shutting_down());

        self.standby.store(true, Ordering::SeqCst);
        self.signal_scheduling_change(None);
        // 先关闭工作池，解除调度循环在等待空闲位置上的阻塞
        self.pool.shutdown(wait_for_jobs_to_complete).await;
        self.stop_loop().await;

        if let Err(e) = self.store.shutdown().await {
            error!("关闭作业存储失败: {}", e);
            self.notify_error("关闭作业存储失败", &e);
        }
        self.shut_down.store(true, Ordering::SeqCst);

        StructuredLogger::log_scheduler_lifecycle(&self.name, &self.instance_id, "shutdown");
        self.notify_scheduler_listeners(|l| l.scheduler_shutdown());
        Ok(())
    }

    async fn metadata(&self) -> SchedulerResult<SchedulerMetaData> {
        Ok(SchedulerMetaData {
            scheduler_name: self.name.clone(),
            instance_id: self.instance_id.clone(),
            started: self.is_started(),
            in_standby_mode: self.is_in_standby_mode(),
            shutdown: self.is_shutdown(),
            running_since: *lock(&self.running_since),
            number_of_jobs_executed: self.jobs_executed.load(Ordering::SeqCst),
            job_store: self.job_store_name.clone(),
            job_store_supports_persistence: self.store.supports_persistence(),
            job_store_clustered: self.store.is_clustered(),
            thread_pool_size: self.pool.pool_size(),
        })
    }

    async fn currently_executing_jobs(&self) -> Vec<ExecutingJob> {
        let mut jobs: Vec<ExecutingJob> = lock(&self.executing)
            .values()
            .map(|(job, _)| job.clone())
            .collect();
        jobs.sort_by(|a, b| a.fire_time.cmp(&b.fire_time));
        jobs
    }

    async fn schedule_job(
        &self,
        job: &JobDetail,
        trigger: &Trigger,
    ) -> SchedulerResult<DateTime<Utc>> {
        self.ensure_running()?;
        self.check_job_instantiable(job)?;
        if trigger.job_key != job.key {
            return Err(SchedulerError::Validation(format!(
                "触发器 {} 引用的作业 {} 与 {} 不一致",
                trigger.key, trigger.job_key, job.key
            )));
        }
        let trigger = self.prepare_trigger(trigger).await?;
        let first_fire_time = trigger.next_fire_time().ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("触发器 {} 没有触发时间", trigger.key))
        })?;

        self.store.store_job_and_trigger(job, &trigger).await?;
        debug!("作业 {} 已调度，首次触发 {}", job.key, first_fire_time);
        self.notify_scheduler_listeners(|l| l.job_added(job));
        self.notify_scheduler_listeners(|l| l.job_scheduled(&trigger));
        self.signal_scheduling_change(Some(first_fire_time));
        Ok(first_fire_time)
    }

    async fn schedule_trigger(&self, trigger: &Trigger) -> SchedulerResult<DateTime<Utc>> {
        self.ensure_running()?;
        let trigger = self.prepare_trigger(trigger).await?;
        let first_fire_time = trigger.next_fire_time().ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("触发器 {} 没有触发时间", trigger.key))
        })?;

        self.store.store_trigger(&trigger, false).await?;
        self.notify_scheduler_listeners(|l| l.job_scheduled(&trigger));
        self.signal_scheduling_change(Some(first_fire_time));
        Ok(first_fire_time)
    }

    async fn schedule_jobs(
        &self,
        jobs: &[(JobDetail, Vec<Trigger>)],
        replace: bool,
    ) -> SchedulerResult<()> {
        self.ensure_running()?;
        let mut prepared = Vec::with_capacity(jobs.len());
        for (job, triggers) in jobs {
            self.check_job_instantiable(job)?;
            if triggers.is_empty() && !job.durable {
                return Err(SchedulerError::Validation(format!(
                    "非持久作业 {} 必须至少有一个触发器",
                    job.key
                )));
            }
            let mut ready = Vec::with_capacity(triggers.len());
            for trigger in triggers {
                if trigger.job_key != job.key {
                    return Err(SchedulerError::Validation(format!(
                        "触发器 {} 引用的作业 {} 与 {} 不一致",
                        trigger.key, trigger.job_key, job.key
                    )));
                }
                ready.push(self.prepare_trigger(trigger).await?);
            }
            prepared.push((job.clone(), ready));
        }

        self.store.store_jobs_and_triggers(&prepared, replace).await?;
        for (job, triggers) in &prepared {
            self.notify_scheduler_listeners(|l| l.job_added(job));
            for trigger in triggers {
                self.notify_scheduler_listeners(|l| l.job_scheduled(trigger));
            }
        }
        self.signal_scheduling_change(None);
        Ok(())
    }

    async fn unschedule_job(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        self.ensure_running()?;
        let removed = self.store.remove_trigger(trigger_key).await?;
        if removed {
            self.notify_scheduler_listeners(|l| l.job_unscheduled(trigger_key));
            self.signal_scheduling_change(None);
        }
        Ok(removed)
    }

    async fn unschedule_jobs(&self, trigger_keys: &[TriggerKey]) -> SchedulerResult<bool> {
        self.ensure_running()?;
        let all_found = self.store.remove_triggers(trigger_keys).await?;
        for key in trigger_keys {
            self.notify_scheduler_listeners(|l| l.job_unscheduled(key));
        }
        self.signal_scheduling_change(None);
        Ok(all_found)
    }

    async fn reschedule_job(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        self.ensure_running()?;
        let Some(old) = self.store.retrieve_trigger(trigger_key).await? else {
            return Ok(None);
        };
        let mut new_trigger = new_trigger.clone();
        new_trigger.job_key = old.job_key;
        let new_trigger = self.prepare_trigger(&new_trigger).await?;

        if !self.store.replace_trigger(trigger_key, &new_trigger).await? {
            return Ok(None);
        }
        let first_fire_time = new_trigger.next_fire_time();
        self.notify_scheduler_listeners(|l| l.job_unscheduled(trigger_key));
        self.notify_scheduler_listeners(|l| l.job_scheduled(&new_trigger));
        self.signal_scheduling_change(first_fire_time);
        Ok(first_fire_time)
    }

    async fn add_job(&self, job: &JobDetail, replace: bool) -> SchedulerResult<()> {
        self.ensure_running()?;
        if !job.durable && !replace {
            return Err(SchedulerError::Validation(format!(
                "没有触发器的作业 {} 必须是持久作业",
                job.key
            )));
        }
        self.check_job_instantiable(job)?;
        self.store.store_job(job, replace).await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.job_added(job));
        Ok(())
    }

    async fn delete_job(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        self.ensure_running()?;
        let triggers = self.store.get_triggers_for_job(job_key).await?;
        let removed = self.store.remove_job(job_key).await?;
        if removed {
            for trigger in &triggers {
                self.notify_scheduler_listeners(|l| l.job_unscheduled(&trigger.key));
            }
            self.signal_scheduling_change(None);
            self.notify_scheduler_listeners(|l| l.job_deleted(job_key));
        }
        Ok(removed)
    }

    async fn delete_jobs(&self, job_keys: &[JobKey]) -> SchedulerResult<bool> {
        let mut all_found = true;
        for key in job_keys {
            all_found = self.delete_job(key).await? && all_found;
        }
        Ok(all_found)
    }

    async fn trigger_job(&self, job_key: &JobKey, data: Option<JobDataMap>) -> SchedulerResult<()> {
        self.ensure_running()?;
        let mut trigger = Trigger::builder()
            .with_key(TriggerKey::unique(MANUAL_TRIGGER_GROUP))
            .for_job(job_key.clone())
            .start_now()
            .with_schedule(SimpleSchedule::once())
            .build();
        if let Some(data) = data {
            trigger.data_map = data;
        }
        trigger.compute_first_fire_time(None);
        let fire_time = trigger.next_fire_time();

        self.store.store_trigger(&trigger, false).await?;
        info!("手动触发作业 {}，触发器 {}", job_key, trigger.key);
        self.signal_scheduling_change(fire_time);
        Ok(())
    }

    async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.pause_job(job_key).await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.job_paused(job_key));
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<()> {
        self.ensure_running()?;
        let groups = self.store.pause_jobs(matcher).await?;
        self.signal_scheduling_change(None);
        for group in &groups {
            self.notify_scheduler_listeners(|l| l.jobs_paused(group));
        }
        Ok(())
    }

    async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.pause_trigger(trigger_key).await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.trigger_paused(trigger_key));
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<()> {
        self.ensure_running()?;
        let groups = self.store.pause_triggers(matcher).await?;
        self.signal_scheduling_change(None);
        for group in &groups {
            self.notify_scheduler_listeners(|l| l.triggers_paused(Some(group)));
        }
        Ok(())
    }

    async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.resume_job(job_key).await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.job_resumed(job_key));
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<()> {
        self.ensure_running()?;
        let groups = self.store.resume_jobs(matcher).await?;
        self.signal_scheduling_change(None);
        for group in &groups {
            self.notify_scheduler_listeners(|l| l.jobs_resumed(group));
        }
        Ok(())
    }

    async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.resume_trigger(trigger_key).await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.trigger_resumed(trigger_key));
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<()> {
        self.ensure_running()?;
        let groups = self.store.resume_triggers(matcher).await?;
        self.signal_scheduling_change(None);
        for group in &groups {
            self.notify_scheduler_listeners(|l| l.triggers_resumed(Some(group)));
        }
        Ok(())
    }

    async fn pause_all(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.pause_all().await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.triggers_paused(None));
        Ok(())
    }

    async fn resume_all(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.resume_all().await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.triggers_resumed(None));
        Ok(())
    }

    async fn get_paused_trigger_groups(&self) -> SchedulerResult<BTreeSet<String>> {
        self.store.get_paused_trigger_groups().await
    }

    async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>> {
        self.store.get_job_group_names().await
    }

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> SchedulerResult<BTreeSet<JobKey>> {
        self.store.get_job_keys(matcher).await
    }

    async fn get_triggers_of_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        self.store.get_triggers_for_job(job_key).await
    }

    async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>> {
        self.store.get_trigger_group_names().await
    }

    async fn get_trigger_keys(
        &self,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<BTreeSet<TriggerKey>> {
        self.store.get_trigger_keys(matcher).await
    }

    async fn get_job_detail(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        self.store.retrieve_job(job_key).await
    }

    async fn get_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        self.store.retrieve_trigger(trigger_key).await
    }

    async fn get_trigger_state(&self, trigger_key: &TriggerKey) -> SchedulerResult<TriggerState> {
        self.store.get_trigger_state(trigger_key).await
    }

    async fn reset_trigger_from_error_state(
        &self,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.reset_trigger_from_error_state(trigger_key).await?;
        self.signal_scheduling_change(None);
        Ok(())
    }

    async fn check_job_exists(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        self.store.check_job_exists(job_key).await
    }

    async fn check_trigger_exists(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        self.store.check_trigger_exists(trigger_key).await
    }

    async fn add_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store
            .store_calendar(name, calendar, replace, update_triggers)
            .await?;
        if update_triggers {
            self.signal_scheduling_change(None);
        }
        Ok(())
    }

    async fn delete_calendar(&self, name: &str) -> SchedulerResult<bool> {
        self.ensure_running()?;
        self.store.remove_calendar(name).await
    }

    async fn get_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        self.store.retrieve_calendar(name).await
    }

    async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>> {
        self.store.get_calendar_names().await
    }

    async fn clear(&self) -> SchedulerResult<()> {
        self.ensure_running()?;
        self.store.clear_all_scheduling_data().await?;
        self.signal_scheduling_change(None);
        self.notify_scheduler_listeners(|l| l.scheduling_data_cleared());
        Ok(())
    }

    async fn interrupt(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        let executing = lock(&self.executing);
        let mut interrupted = false;
        for (job, handle) in executing.values() {
            if &job.job_key == job_key {
                handle.interrupt();
                interrupted = true;
            }
        }
        if interrupted {
            info!("已请求中断作业 {}", job_key);
        }
        Ok(interrupted)
    }

    async fn interrupt_instance(&self, fire_instance_id: &str) -> SchedulerResult<bool> {
        let executing = lock(&self.executing);
        match executing.get(fire_instance_id) {
            Some((job, handle)) => {
                handle.interrupt();
                info!("已请求中断作业 {} 的实例 {}", job.job_key, fire_instance_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl RunShellHost for StdScheduler {
    fn scheduler(self: Arc<Self>) -> Arc<dyn Scheduler> {
        self
    }

    fn job_store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    fn job_factory(&self) -> Arc<dyn JobFactory> {
        self.job_factory.clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn db_failure_retry_interval(&self) -> Duration {
        self.config.db_failure_retry_interval()
    }

    fn notify_trigger_listeners_fired(&self, context: &JobExecutionContext) -> bool {
        let trigger = context.trigger();
        let mut vetoed = false;
        for listener in self.listeners.trigger_listeners_for(&trigger.key) {
            if let Err(e) = listener.trigger_fired(trigger, context) {
                let message = format!("触发器监听器 {} 处理 trigger_fired 失败", listener.name());
                error!("{}: {}", message, e);
                self.notify_error(&message, &e);
            }
            match listener.veto_job_execution(trigger, context) {
                Ok(true) => {
                    debug!("触发器监听器 {} 否决了 {}", listener.name(), trigger.key);
                    vetoed = true;
                }
                Ok(false) => {}
                Err(e) => {
                    let message =
                        format!("触发器监听器 {} 处理 veto_job_execution 失败", listener.name());
                    error!("{}: {}", message, e);
                    self.notify_error(&message, &e);
                }
            }
        }
        vetoed
    }

    fn notify_trigger_listeners_complete(
        &self,
        context: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        let trigger = context.trigger();
        self.notify_trigger_listeners(&trigger.key, "trigger_complete", |l| {
            l.trigger_complete(trigger, context, instruction)
        });
    }

    fn notify_job_listeners_to_be_executed(&self, context: &JobExecutionContext) {
        self.notify_job_listeners(&context.job_detail().key, "job_to_be_executed", |l| {
            l.job_to_be_executed(context)
        });
    }

    fn notify_job_listeners_vetoed(&self, context: &JobExecutionContext) {
        self.notify_job_listeners(&context.job_detail().key, "job_execution_vetoed", |l| {
            l.job_execution_vetoed(context)
        });
    }

    fn notify_job_listeners_was_executed(
        &self,
        context: &JobExecutionContext,
        error: Option<&JobExecutionError>,
    ) {
        self.notify_job_listeners(&context.job_detail().key, "job_was_executed", |l| {
            l.job_was_executed(context, error)
        });
    }

    fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        self.notify_finalized(trigger);
    }

    fn notify_scheduler_listeners_error(&self, message: &str, error: &SchedulerError) {
        self.notify_error(message, error);
    }

    fn job_started(&self, context: &JobExecutionContext) {
        let job = ExecutingJob {
            fire_instance_id: context.fire_instance_id().to_string(),
            job_key: context.job_detail().key.clone(),
            trigger_key: context.trigger().key.clone(),
            fire_time: context.fire_time(),
            scheduled_fire_time: context.scheduled_fire_time(),
            recovering: context.is_recovering(),
        };
        lock(&self.executing).insert(
            job.fire_instance_id.clone(),
            (job, context.interrupt_handle().clone()),
        );
    }

    fn job_finished(&self, fire_instance_id: &str) {
        lock(&self.executing).remove(fire_instance_id);
        self.jobs_executed.fetch_add(1, Ordering::SeqCst);
    }
}

impl SchedulerSignaler for StoreSignaler {
    fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.notify_misfired(trigger);
        }
    }

    fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.notify_finalized(trigger);
        }
    }

    fn notify_scheduler_listeners_job_deleted(&self, job_key: &JobKey) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.notify_scheduler_listeners(|l| l.job_deleted(job_key));
        }
    }

    fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.signal_scheduling_change(candidate_new_next_fire_time);
        }
    }

    fn notify_scheduler_listeners_error(&self, message: &str, error: &SchedulerError) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.notify_error(message, error);
        }
    }
}
