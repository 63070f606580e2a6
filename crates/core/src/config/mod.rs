//! 调度器配置
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → 环境变量覆盖。
//!
//! 环境变量以 `SCHEDULER_` 为前缀，层级之间用 `__` 分隔，例如
//! `SCHEDULER_JOB_STORE__KIND=sqlite`、`SCHEDULER_THREAD_POOL__THREAD_COUNT=4`。

mod sections;

pub use sections::{
    JobStoreKind, JobStoreSection, LockHandlerKind, LoggingSection, SchedulerSection,
    ThreadPoolSection, AUTO_INSTANCE_ID,
};

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

/// 未指定配置文件时依次尝试的路径
const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/scheduler.toml",
    "scheduler.toml",
    "/etc/scheduler/config.toml",
];

/// 调度器完整配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scheduler: SchedulerSection,
    pub thread_pool: ThreadPoolSection,
    pub job_store: JobStoreSection,
    pub logging: LoggingSection,
}

impl SchedulerConfig {
    /// 从配置文件和环境变量加载配置并校验
    ///
    /// `config_path` 为 None 时尝试默认路径，都不存在则只使用默认值和环境变量。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else if let Some(path) = DEFAULT_CONFIG_PATHS
            .iter()
            .find(|path| Path::new(path).exists())
        {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: SchedulerConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: SchedulerConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.thread_pool.validate().context("线程池配置验证失败")?;
        self.job_store.validate().context("作业存储配置验证失败")?;
        self.logging.validate().context("日志配置验证失败")?;
        Ok(())
    }

    /// 解析实例标识，`AUTO` 时生成 主机名 + 毫秒时间戳
    pub fn resolve_instance_id(&self) -> String {
        if self.scheduler.instance_id != AUTO_INSTANCE_ID {
            return self.scheduler.instance_id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("{}{}", host, chrono::Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.instance_name, "DefaultScheduler");
        assert_eq!(config.thread_pool.thread_count, 10);
        assert_eq!(config.job_store.misfire_threshold_ms, 60_000);
        assert_eq!(config.job_store.kind, JobStoreKind::Ram);
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let sample = include_str!("../../../../config/scheduler.toml");
        let config = SchedulerConfig::from_toml(sample).unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SchedulerConfig::from_toml(
            r#"
            [scheduler]
            instance_name = "Reports"
            batch_trigger_acquisition_max_count = 5

            [job_store]
            kind = "sqlite"
            database_url = "sqlite://reports.db"
            lock_handler = "in_process"
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.instance_name, "Reports");
        assert_eq!(config.scheduler.batch_trigger_acquisition_max_count, 5);
        assert_eq!(config.scheduler.idle_wait_time_ms, 30_000);
        assert_eq!(config.job_store.lock_handler, LockHandlerKind::InProcess);
    }

    #[test]
    fn test_clustered_ram_store_rejected() {
        let mut config = SchedulerConfig::default();
        config.job_store.is_clustered = true;
        let err = config.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("集群模式需要持久化存储"));
    }

    #[test]
    fn test_invalid_logging_rejected() {
        let mut config = SchedulerConfig::default();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[thread_pool]\nthread_count = 3").unwrap();
        let config = SchedulerConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.thread_pool.thread_count, 3);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(SchedulerConfig::load(Some("/nonexistent/scheduler.toml")).is_err());
    }

    #[test]
    fn test_auto_instance_id() {
        let mut config = SchedulerConfig::default();
        assert_eq!(config.resolve_instance_id(), "NON_CLUSTERED");
        config.scheduler.instance_id = AUTO_INSTANCE_ID.to_string();
        let id = config.resolve_instance_id();
        assert_ne!(id, AUTO_INSTANCE_ID);
        assert!(!id.is_empty());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SchedulerConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(SchedulerConfig::from_toml(&text).unwrap(), config);
    }
}
