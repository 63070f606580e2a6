//! # scheduler-infrastructure
//!
//! 作业存储实现与可观测性：
//! - [`RamJobStore`] 内存存储，不持久化
//! - [`SqliteJobStore`] SQLite 持久化存储，支持集群
//! - 指标与结构化日志

pub mod database;
pub mod observability;
pub mod ram_job_store;
pub mod recovery;

use std::sync::Arc;

use scheduler_core::config::{JobStoreKind, SchedulerConfig};
use scheduler_core::{JobStore, SchedulerResult};

pub use database::SqliteJobStore;
pub use observability::{MetricsCollector, StructuredLogger};
pub use ram_job_store::RamJobStore;

/// 按配置创建作业存储
pub async fn job_store_from_config(
    config: &SchedulerConfig,
    instance_id: &str,
) -> SchedulerResult<Arc<dyn JobStore>> {
    match config.job_store.kind {
        JobStoreKind::Ram => Ok(Arc::new(RamJobStore::from_config(
            &config.job_store,
            instance_id,
        ))),
        JobStoreKind::Sqlite => Ok(Arc::new(
            SqliteJobStore::new_embedded(
                &config.job_store,
                &config.scheduler.instance_name,
                instance_id,
            )
            .await?,
        )),
    }
}
