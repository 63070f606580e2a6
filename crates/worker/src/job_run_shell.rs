use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use scheduler_core::{
    CompletedExecutionInstruction, InterruptHandle, Job, JobDetail, JobExecutionContext,
    JobExecutionError, JobFactory, JobStore, Scheduler, SchedulerError, Trigger,
    TriggerFiredBundle,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};
use tracing::{error, info, warn};

/// 运行一次作业所需的调度器能力
///
/// 由调度器实现；执行器通过它通知监听器、回写存储并登记正在执行的作业。
pub trait RunShellHost: Send + Sync {
    /// 作业上下文中回指的调度器
    fn scheduler(self: Arc<Self>) -> Arc<dyn Scheduler>;

    fn job_store(&self) -> Arc<dyn JobStore>;

    fn job_factory(&self) -> Arc<dyn JobFactory>;

    fn is_shutting_down(&self) -> bool;

    /// 回写存储失败后的重试间隔
    fn db_failure_retry_interval(&self) -> Duration;

    /// 通知触发器监听器，返回 true 表示有监听器否决本次执行
    fn notify_trigger_listeners_fired(&self, context: &JobExecutionContext) -> bool;

    fn notify_trigger_listeners_complete(
        &self,
        context: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    );

    fn notify_job_listeners_to_be_executed(&self, context: &JobExecutionContext);

    fn notify_job_listeners_vetoed(&self, context: &JobExecutionContext);

    fn notify_job_listeners_was_executed(
        &self,
        context: &JobExecutionContext,
        error: Option<&JobExecutionError>,
    );

    fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

    fn notify_scheduler_listeners_error(&self, message: &str, error: &SchedulerError);

    /// 作业开始执行，登记中断句柄
    fn job_started(&self, context: &JobExecutionContext);

    fn job_finished(&self, fire_instance_id: &str);
}

/// 单次触发的执行外壳
///
/// 负责实例化作业、通知监听器、执行（含立即重试）以及把完成指令回写存储。
pub struct JobRunShell {
    host: Arc<dyn RunShellHost>,
    bundle: TriggerFiredBundle,
    metrics: MetricsCollector,
}

impl JobRunShell {
    pub fn new(host: Arc<dyn RunShellHost>, bundle: TriggerFiredBundle) -> Self {
        Self {
            host,
            bundle,
            metrics: MetricsCollector::new(),
        }
    }

    pub async fn run(self) {
        let job_key = self.bundle.job_detail.key.clone();
        let job = match self
            .host
            .job_factory()
            .new_job(&self.bundle.job_detail.job_type, &self.bundle.job_detail.data_map)
        {
            Ok(job) => job,
            Err(e) => {
                error!("实例化作业 {} 失败: {}", job_key, e);
                self.host
                    .notify_scheduler_listeners_error(&format!("实例化作业 {job_key} 失败"), &e);
                self.complete(
                    &self.bundle.trigger,
                    &self.bundle.job_detail,
                    CompletedExecutionInstruction::SetAllJobTriggersError,
                )
                .await;
                return;
            }
        };

        let mut context = JobExecutionContext::new(
            self.host.clone().scheduler(),
            &self.bundle,
            InterruptHandle::new(),
        );
        self.host.job_started(&context);
        self.execute_loop(job.as_ref(), &mut context).await;
        self.host.job_finished(context.fire_instance_id());
    }

    async fn execute_loop(&self, job: &dyn Job, context: &mut JobExecutionContext) {
        loop {
            if self.host.notify_trigger_listeners_fired(context) {
                info!(
                    "作业 {} 的执行被触发器 {} 的监听器否决",
                    context.job_detail().key,
                    context.trigger().key
                );
                self.metrics.record_job_vetoed();
                self.host.notify_job_listeners_vetoed(context);
                let instruction = context.trigger().execution_complete(None);
                if context.trigger().next_fire_time().is_none() {
                    self.host
                        .notify_scheduler_listeners_finalized(context.trigger());
                }
                self.complete(context.trigger(), context.job_detail(), instruction)
                    .await;
                return;
            }

            self.host.notify_job_listeners_to_be_executed(context);
            StructuredLogger::log_job_execution_start(
                &context.job_detail().key,
                &context.trigger().key,
                context.fire_instance_id(),
                context.refire_count(),
            );

            let started = Instant::now();
            let outcome = AssertUnwindSafe(job.execute(context)).catch_unwind().await;
            let elapsed = started.elapsed();
            let result = match outcome {
                Ok(result) => result,
                Err(panic) => Err(JobExecutionError::new(format!(
                    "作业执行发生 panic: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            let error = result.err();

            self.metrics
                .record_job_execution(error.is_none(), elapsed.as_secs_f64());
            self.host
                .notify_job_listeners_was_executed(context, error.as_ref());

            let instruction = context.trigger().execution_complete(error.as_ref());
            StructuredLogger::log_job_execution_complete(
                &context.job_detail().key,
                &context.trigger().key,
                context.fire_instance_id(),
                elapsed.as_millis() as u64,
                instruction,
                error.as_ref().map(|e| e.message.as_str()),
            );
            self.host.notify_trigger_listeners_complete(context, instruction);

            if instruction == CompletedExecutionInstruction::ReExecuteJob {
                if self.host.is_shutting_down() {
                    warn!("调度器正在关闭，放弃立即重新执行 {}", context.job_detail().key);
                    self.complete(
                        context.trigger(),
                        context.job_detail(),
                        CompletedExecutionInstruction::Noop,
                    )
                    .await;
                    return;
                }
                context.increment_refire_count();
                info!(
                    "作业 {} 请求立即重新执行，第 {} 次",
                    context.job_detail().key,
                    context.refire_count()
                );
                continue;
            }

            if context.trigger().next_fire_time().is_none() {
                self.host
                    .notify_scheduler_listeners_finalized(context.trigger());
            }

            let mut job_detail = context.job_detail().clone();
            if job_detail.persist_data_after_execution {
                job_detail.data_map = context.job_data_map().clone();
            }
            self.complete(context.trigger(), &job_detail, instruction)
                .await;
            return;
        }
    }

    /// 回写执行结果，存储不可用时按间隔重试直到成功或调度器关闭
    async fn complete(
        &self,
        trigger: &Trigger,
        job_detail: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) {
        let store = self.host.job_store();
        loop {
            match store
                .triggered_job_complete(trigger, job_detail, instruction)
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    error!(
                        "回写触发器 {} 的完成状态失败: {}",
                        trigger.key, e
                    );
                    self.host.notify_scheduler_listeners_error(
                        &format!("回写触发器 {} 的完成状态失败", trigger.key),
                        &e,
                    );
                    if self.host.is_shutting_down() {
                        warn!("调度器正在关闭，放弃回写 {}", trigger.key);
                        return;
                    }
                    tokio::time::sleep(self.host.db_failure_retry_interval()).await;
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知错误".to_string()
    }
}
