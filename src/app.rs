use std::sync::Arc;

use anyhow::{Context, Result};
use scheduler_core::{Scheduler, SchedulerConfig};
use scheduler_dispatcher::{SchedulerBuilder, SchedulerRegistry, StdScheduler};
use scheduler_worker::SimpleJobFactory;
use tokio::sync::broadcast;
use tracing::info;

/// 主应用程序
///
/// 持有调度器注册表和按配置创建的调度器，`run` 启动调度器并在收到关闭信号后
/// 等待正在执行的作业完成再退出。
pub struct Application {
    registry: SchedulerRegistry,
    scheduler: Arc<StdScheduler>,
}

impl Application {
    pub async fn new(config: SchedulerConfig) -> Result<Self> {
        Self::with_job_factory(config, Arc::new(SimpleJobFactory::with_builtin_jobs())).await
    }

    /// 使用自定义作业工厂，嵌入方可以注册自己的作业类型
    pub async fn with_job_factory(
        config: SchedulerConfig,
        job_factory: Arc<SimpleJobFactory>,
    ) -> Result<Self> {
        info!(
            "初始化调度器 {}，作业存储: {:?}，工作线程: {}",
            config.scheduler.instance_name,
            config.job_store.kind,
            config.thread_pool.thread_count
        );
        info!("已注册的作业类型: {:?}", job_factory.job_types());

        let registry = SchedulerRegistry::new();
        let scheduler = SchedulerBuilder::new(config)
            .with_job_factory(job_factory)
            .build_into(&registry)
            .await
            .context("创建调度器失败")?;

        Ok(Self {
            registry,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> &Arc<StdScheduler> {
        &self.scheduler
    }

    pub fn registry(&self) -> &SchedulerRegistry {
        &self.registry
    }

    /// 启动调度器，阻塞到收到关闭信号，然后关闭所有调度器
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler.start().await.context("启动调度器失败")?;

        let metadata = self.scheduler.metadata().await?;
        info!(
            "调度器已启动: {}",
            serde_json::to_string(&metadata).context("序列化调度器概况失败")?
        );

        let _ = shutdown_rx.recv().await;
        info!("收到关闭信号，等待正在执行的作业完成");
        self.registry.shutdown_all(true).await;

        let executed = self.scheduler.metadata().await?.number_of_jobs_executed;
        info!("调度器已关闭，共执行作业 {} 次", executed);
        Ok(())
    }
}
