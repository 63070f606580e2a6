use std::sync::Arc;

use scheduler_core::config::JobStoreKind;
use scheduler_core::{JobFactory, JobStore, SchedulerConfig, SchedulerError, SchedulerResult};
use scheduler_infrastructure::job_store_from_config;
use scheduler_worker::SimpleJobFactory;
use tracing::info;

use crate::registry::SchedulerRegistry;
use crate::scheduler::{SchedulerResources, StdScheduler};

/// 根据配置组装调度器：作业存储 → 工作池 → 调度器
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    job_factory: Option<Arc<dyn JobFactory>>,
    job_store: Option<Arc<dyn JobStore>>,
}

impl SchedulerBuilder {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            job_factory: None,
            job_store: None,
        }
    }

    /// 默认使用预注册内置作业的 [`SimpleJobFactory`]
    pub fn with_job_factory(mut self, job_factory: Arc<dyn JobFactory>) -> Self {
        self.job_factory = Some(job_factory);
        self
    }

    /// 使用外部创建的存储，忽略配置中的存储设置
    pub fn with_job_store(mut self, job_store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(job_store);
        self
    }

    pub async fn build(self) -> SchedulerResult<Arc<StdScheduler>> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::Configuration(format!("{e:#}")))?;

        let instance_id = self.config.resolve_instance_id();
        let (job_store, job_store_name) = match self.job_store {
            Some(store) => (store, "CustomJobStore".to_string()),
            None => {
                let store = job_store_from_config(&self.config, &instance_id).await?;
                let name = match self.config.job_store.kind {
                    JobStoreKind::Ram => "RamJobStore",
                    JobStoreKind::Sqlite => "SqliteJobStore",
                };
                (store, name.to_string())
            }
        };
        let job_factory = self
            .job_factory
            .unwrap_or_else(|| Arc::new(SimpleJobFactory::with_builtin_jobs()));

        info!(
            "创建调度器 {}，实例 {}，存储 {}",
            self.config.scheduler.instance_name, instance_id, job_store_name
        );
        let scheduler = StdScheduler::new(SchedulerResources {
            name: self.config.scheduler.instance_name.clone(),
            instance_id,
            config: self.config.scheduler.clone(),
            job_store_name,
            job_store,
            job_factory,
            thread_count: self.config.thread_pool.thread_count,
        });
        scheduler.initialize().await?;
        Ok(scheduler)
    }

    /// 构建并注册到给定注册表
    pub async fn build_into(self, registry: &SchedulerRegistry) -> SchedulerResult<Arc<StdScheduler>> {
        let scheduler = self.build().await?;
        registry.bind(scheduler.clone())?;
        Ok(scheduler)
    }
}
