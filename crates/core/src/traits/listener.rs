use crate::errors::JobExecutionError;
use crate::models::{CompletedExecutionInstruction, JobDetail, JobKey, Trigger, TriggerKey};
use crate::traits::JobExecutionContext;
use crate::{SchedulerError, SchedulerResult};

/// 作业生命周期监听器；返回的错误只会被记录，不影响调度
pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;

    fn job_to_be_executed(&self, _context: &JobExecutionContext) -> SchedulerResult<()> {
        Ok(())
    }

    /// 触发器监听器否决了本次执行
    fn job_execution_vetoed(&self, _context: &JobExecutionContext) -> SchedulerResult<()> {
        Ok(())
    }

    fn job_was_executed(
        &self,
        _context: &JobExecutionContext,
        _error: Option<&JobExecutionError>,
    ) -> SchedulerResult<()> {
        Ok(())
    }
}

/// 触发器生命周期监听器
pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;

    fn trigger_fired(&self, _trigger: &Trigger, _context: &JobExecutionContext) -> SchedulerResult<()> {
        Ok(())
    }

    /// 返回 true 表示否决本次作业执行
    fn veto_job_execution(
        &self,
        _trigger: &Trigger,
        _context: &JobExecutionContext,
    ) -> SchedulerResult<bool> {
        Ok(false)
    }

    fn trigger_misfired(&self, _trigger: &Trigger) -> SchedulerResult<()> {
        Ok(())
    }

    fn trigger_complete(
        &self,
        _trigger: &Trigger,
        _context: &JobExecutionContext,
        _instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()> {
        Ok(())
    }
}

/// 调度器事件监听器
#[allow(unused_variables)]
pub trait SchedulerListener: Send + Sync {
    fn job_scheduled(&self, trigger: &Trigger) {}

    fn job_unscheduled(&self, trigger_key: &TriggerKey) {}

    /// 触发器不会再触发
    fn trigger_finalized(&self, trigger: &Trigger) {}

    fn trigger_paused(&self, trigger_key: &TriggerKey) {}

    fn triggers_paused(&self, group: Option<&str>) {}

    fn trigger_resumed(&self, trigger_key: &TriggerKey) {}

    fn triggers_resumed(&self, group: Option<&str>) {}

    fn job_added(&self, job: &JobDetail) {}

    fn job_deleted(&self, job_key: &JobKey) {}

    fn job_paused(&self, job_key: &JobKey) {}

    fn jobs_paused(&self, group: &str) {}

    fn job_resumed(&self, job_key: &JobKey) {}

    fn jobs_resumed(&self, group: &str) {}

    fn scheduler_error(&self, message: &str, error: &SchedulerError) {}

    fn scheduler_in_standby(&self) {}

    fn scheduler_starting(&self) {}

    fn scheduler_started(&self) {}

    fn scheduler_shutting_down(&self) {}

    fn scheduler_shutdown(&self) {}

    fn scheduling_data_cleared(&self) {}
}
