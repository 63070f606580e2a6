use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use scheduler_core::{
    CompletedExecutionInstruction, JobStore, SchedulerError, Trigger, TriggerFiredResult,
};
use scheduler_worker::JobRunShell;
use tracing::{debug, error, info, warn};

use crate::scheduler::StdScheduler;

/// 距离触发时间小于该值时不再等待
const FIRE_TIME_TOLERANCE_MS: i64 = 2;
/// 待机时的轮询间隔
const PAUSED_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// 内存存储连续失败时的最大退避
const MAX_RAM_RETRY_DELAY_MS: u64 = 600;

/// 调度循环
///
/// 每一轮：等待空闲执行位置 → 获取即将到期的触发器 → 等到触发时间 →
/// 标记触发 → 提交执行。等待期间收到更早的调度变更时释放已获取的触发器重新获取。
pub(crate) struct SchedulerLoop {
    scheduler: Arc<StdScheduler>,
    store: Arc<dyn JobStore>,
    consecutive_failures: u32,
}

enum WaitOutcome {
    Ready,
    /// 有更早的触发器，已获取的触发器需要释放
    Superseded,
    Halted,
}

impl SchedulerLoop {
    pub(crate) fn new(scheduler: Arc<StdScheduler>) -> Self {
        let store = scheduler.job_store().clone();
        Self {
            scheduler,
            store,
            consecutive_failures: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("调度循环启动");
        loop {
            if self.scheduler.is_halted() {
                break;
            }
            if self.scheduler.is_paused() {
                self.scheduler.signal().wait(PAUSED_POLL_INTERVAL).await;
                self.scheduler.signal().clear();
                continue;
            }

            let available = self.scheduler.pool().block_for_available_threads().await;
            if self.scheduler.is_halted() || available == 0 {
                continue;
            }

            let config = self.scheduler.config();
            let idle_wait = config.idle_wait_time();
            let max_count = available.min(config.batch_trigger_acquisition_max_count);
            let time_window = chrono::Duration::milliseconds(
                config.batch_trigger_acquisition_fire_ahead_time_window_ms as i64,
            );

            self.scheduler.signal().clear();
            let no_later_than = Utc::now()
                + chrono::Duration::from_std(idle_wait).unwrap_or(chrono::Duration::seconds(30));
            let triggers = match self
                .store
                .acquire_next_triggers(no_later_than, max_count, time_window)
                .await
            {
                Ok(triggers) => {
                    self.consecutive_failures = 0;
                    triggers
                }
                Err(e) => {
                    self.on_store_failure("获取触发器失败", &e).await;
                    continue;
                }
            };

            if triggers.is_empty() {
                let wait = self.randomized_idle_wait(idle_wait);
                debug!("没有即将到期的触发器，空闲等待 {:?}", wait);
                self.scheduler.signal().wait(wait).await;
                continue;
            }

            match self.wait_until_fire_time(&triggers).await {
                WaitOutcome::Ready => {}
                WaitOutcome::Superseded => {
                    debug!("出现更早的触发器，释放已获取的 {} 个触发器", triggers.len());
                    self.release_all(&triggers).await;
                    continue;
                }
                WaitOutcome::Halted => {
                    self.release_all(&triggers).await;
                    break;
                }
            }

            self.fire(triggers).await;
        }
        info!("调度循环已退出");
    }

    /// 等到第一个触发器的触发时间
    async fn wait_until_fire_time(&self, triggers: &[Trigger]) -> WaitOutcome {
        let Some(fire_time) = triggers.first().and_then(Trigger::next_fire_time) else {
            return WaitOutcome::Ready;
        };
        loop {
            if self.scheduler.is_halted() {
                return WaitOutcome::Halted;
            }
            if self.is_candidate_earlier_within_reason(fire_time) {
                return WaitOutcome::Superseded;
            }
            let until = fire_time - Utc::now();
            if until.num_milliseconds() <= FIRE_TIME_TOLERANCE_MS {
                return WaitOutcome::Ready;
            }
            let timeout = until.to_std().unwrap_or(Duration::ZERO);
            self.scheduler.signal().wait(timeout).await;
        }
    }

    /// 调度变更的候选时间是否早到值得释放重新获取
    fn is_candidate_earlier_within_reason(&self, fire_time: chrono::DateTime<Utc>) -> bool {
        let Some(change) = self.scheduler.signal().take() else {
            return false;
        };
        // 距触发时间不足一次释放加获取的耗时则不释放
        change.is_earlier_than(fire_time)
            && (fire_time - Utc::now()) > self.store.estimated_time_to_release_and_acquire_trigger()
    }

    async fn fire(&mut self, triggers: Vec<Trigger>) {
        // 工作池名额已在获取前确认；只有关闭途中才可能不足
        let capacity = self.scheduler.pool().available();
        let (triggers, excess) = if triggers.len() > capacity {
            let mut triggers = triggers;
            let excess = triggers.split_off(capacity);
            (triggers, excess)
        } else {
            (triggers, Vec::new())
        };
        if !excess.is_empty() {
            warn!("工作池名额不足，释放 {} 个触发器", excess.len());
            self.release_all(&excess).await;
        }
        if triggers.is_empty() {
            return;
        }

        let results = match self.store.triggers_fired(&triggers).await {
            Ok(results) => {
                self.consecutive_failures = 0;
                results
            }
            Err(e) => {
                self.on_store_failure("标记触发器触发失败", &e).await;
                self.release_all(&triggers).await;
                return;
            }
        };

        for (trigger, result) in triggers.iter().zip(results) {
            match result {
                TriggerFiredResult::Fired(bundle) => {
                    let job_detail = bundle.job_detail.clone();
                    let fired_trigger = bundle.trigger.clone();
                    let shell = JobRunShell::new(self.scheduler.clone(), *bundle);
                    if !self.scheduler.pool().run_in_thread(shell.run()) {
                        let e = SchedulerError::JobRejected(format!(
                            "工作池拒绝执行作业 {}",
                            job_detail.key
                        ));
                        error!("{}", e);
                        self.scheduler
                            .notify_error("工作池拒绝执行作业", &e);
                        if let Err(e) = self
                            .store
                            .triggered_job_complete(
                                &fired_trigger,
                                &job_detail,
                                CompletedExecutionInstruction::Noop,
                            )
                            .await
                        {
                            error!("回写被拒绝的触发器 {} 失败: {}", fired_trigger.key, e);
                        }
                    }
                }
                TriggerFiredResult::Skipped => {
                    debug!("触发器 {} 已不可触发，跳过", trigger.key);
                    // 暂停或被其他实例抢先的触发器仍留有获取记录
                    self.release(trigger).await;
                }
                TriggerFiredResult::Failed(e) => {
                    error!("触发器 {} 触发失败: {}", trigger.key, e);
                    self.scheduler
                        .notify_error(&format!("触发器 {} 触发失败", trigger.key), &e);
                    self.release(trigger).await;
                }
            }
        }
    }

    async fn release(&self, trigger: &Trigger) {
        if let Err(e) = self.store.release_acquired_trigger(trigger).await {
            error!("释放触发器 {} 失败: {}", trigger.key, e);
            self.scheduler
                .notify_error(&format!("释放触发器 {} 失败", trigger.key), &e);
        }
    }

    async fn release_all(&self, triggers: &[Trigger]) {
        for trigger in triggers {
            self.release(trigger).await;
        }
    }

    /// 存储出错时通知监听器（连续失败只在前几次和之后每隔若干次通知）并退避
    async fn on_store_failure(&mut self, message: &str, error: &SchedulerError) {
        self.consecutive_failures += 1;
        error!("{}（连续第 {} 次）: {}", message, self.consecutive_failures, error);
        if self.consecutive_failures % 4 == 1 {
            self.scheduler.notify_error(message, error);
        }

        let delay = if self.store.supports_persistence() {
            self.scheduler.config().db_failure_retry_interval()
        } else {
            Duration::from_millis(
                (u64::from(self.consecutive_failures) * 20).min(MAX_RAM_RETRY_DELAY_MS),
            )
        };
        self.scheduler.signal().wait(delay).await;
    }

    /// 空闲等待时间减去至多 20% 的随机抖动
    fn randomized_idle_wait(&self, idle_wait: Duration) -> Duration {
        let variance = (idle_wait.as_millis() as u64) / 5;
        if variance == 0 {
            return idle_wait;
        }
        let jitter = rand::rng().random_range(0..=variance);
        idle_wait.saturating_sub(Duration::from_millis(jitter))
    }
}
