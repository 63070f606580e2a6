use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use scheduler_core::{Scheduler, SchedulerError, SchedulerResult};
use tracing::{error, info};

use crate::scheduler::StdScheduler;

/// 按名称查找调度器的注册表
///
/// 由应用入口持有并按需传递，进程内可以同时存在多个互不相干的注册表。
#[derive(Default)]
pub struct SchedulerRegistry {
    schedulers: RwLock<HashMap<String, Arc<StdScheduler>>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册调度器，同名调度器已存在时报错
    pub fn bind(&self, scheduler: Arc<StdScheduler>) -> SchedulerResult<()> {
        let name = scheduler.scheduler_name().to_string();
        let mut schedulers = match self.schedulers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if schedulers.contains_key(&name) {
            return Err(SchedulerError::ObjectAlreadyExists(format!(
                "调度器 {name} 已注册"
            )));
        }
        info!("注册调度器: {}", name);
        schedulers.insert(name, scheduler);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<StdScheduler>> {
        match self.schedulers.read() {
            Ok(guard) => guard.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut schedulers = match self.schedulers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        schedulers.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let schedulers = match self.schedulers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = schedulers.keys().cloned().collect();
        names.sort();
        names
    }

    /// 关闭并移除全部调度器
    pub async fn shutdown_all(&self, wait_for_jobs_to_complete: bool) {
        let schedulers: Vec<Arc<StdScheduler>> = {
            let mut guard = match self.schedulers.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain().map(|(_, scheduler)| scheduler).collect()
        };
        for scheduler in schedulers {
            if let Err(e) = scheduler.shutdown(wait_for_jobs_to_complete).await {
                error!("关闭调度器 {} 失败: {}", scheduler.scheduler_name(), e);
            }
        }
    }
}
