use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 自动生成实例标识的占位值
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// 调度器主体配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub instance_name: String,
    /// `AUTO` 时使用主机名加毫秒时间戳
    pub instance_id: String,
    /// 没有可触发的触发器时的空闲等待时间
    pub idle_wait_time_ms: u64,
    pub batch_trigger_acquisition_max_count: usize,
    pub batch_trigger_acquisition_fire_ahead_time_window_ms: u64,
    /// 存储不可用时的重试间隔
    pub db_failure_retry_interval_ms: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            instance_name: "DefaultScheduler".to_string(),
            instance_id: "NON_CLUSTERED".to_string(),
            idle_wait_time_ms: 30_000,
            batch_trigger_acquisition_max_count: 1,
            batch_trigger_acquisition_fire_ahead_time_window_ms: 0,
            db_failure_retry_interval_ms: 15_000,
        }
    }
}

impl SchedulerSection {
    pub fn idle_wait_time(&self) -> Duration {
        Duration::from_millis(self.idle_wait_time_ms)
    }

    pub fn db_failure_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_failure_retry_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instance_name.trim().is_empty() {
            return Err(anyhow::anyhow!("调度器名称不能为空"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(anyhow::anyhow!("调度器实例标识不能为空"));
        }
        if self.idle_wait_time_ms < 1_000 {
            return Err(anyhow::anyhow!(
                "空闲等待时间不能小于1000毫秒，当前为 {}",
                self.idle_wait_time_ms
            ));
        }
        if self.batch_trigger_acquisition_max_count == 0 {
            return Err(anyhow::anyhow!("批量获取触发器数量必须大于0"));
        }
        if self.db_failure_retry_interval_ms == 0 {
            return Err(anyhow::anyhow!("存储失败重试间隔必须大于0"));
        }
        Ok(())
    }
}

/// 工作线程池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolSection {
    pub thread_count: usize,
}

impl Default for ThreadPoolSection {
    fn default() -> Self {
        Self { thread_count: 10 }
    }
}

impl ThreadPoolSection {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.thread_count == 0 {
            return Err(anyhow::anyhow!("工作线程数必须大于0"));
        }
        Ok(())
    }
}

/// 作业存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStoreKind {
    Ram,
    Sqlite,
}

/// 持久化存储的互斥锁实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockHandlerKind {
    /// 基于锁表行更新，支持多进程
    RowLock,
    /// 进程内互斥，仅限单实例
    InProcess,
}

/// 作业存储配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStoreSection {
    pub kind: JobStoreKind,
    pub misfire_threshold_ms: u64,
    pub database_url: String,
    pub max_connections: u32,
    pub is_clustered: bool,
    pub cluster_checkin_interval_ms: u64,
    pub lock_handler: LockHandlerKind,
    pub max_lock_retry: u32,
    pub lock_retry_interval_ms: u64,
    /// 获取触发器时总是持有触发器锁
    pub acquire_triggers_within_lock: bool,
}

impl Default for JobStoreSection {
    fn default() -> Self {
        Self {
            kind: JobStoreKind::Ram,
            misfire_threshold_ms: 60_000,
            database_url: "sqlite://data/scheduler.db".to_string(),
            max_connections: 5,
            is_clustered: false,
            cluster_checkin_interval_ms: 7_500,
            lock_handler: LockHandlerKind::RowLock,
            max_lock_retry: 3,
            lock_retry_interval_ms: 1_000,
            acquire_triggers_within_lock: false,
        }
    }
}

impl JobStoreSection {
    pub fn misfire_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(i64::try_from(self.misfire_threshold_ms).unwrap_or(i64::MAX))
    }

    pub fn cluster_checkin_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_checkin_interval_ms)
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_interval_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.misfire_threshold_ms == 0 {
            return Err(anyhow::anyhow!("错过触发阈值必须大于0"));
        }
        if self.kind == JobStoreKind::Sqlite {
            if !self.database_url.starts_with("sqlite:") {
                return Err(anyhow::anyhow!(
                    "数据库URL格式无效: {}，需要以 sqlite: 开头",
                    self.database_url
                ));
            }
            if self.max_connections == 0 {
                return Err(anyhow::anyhow!("最大连接数必须大于0"));
            }
        }
        if self.is_clustered {
            if self.kind != JobStoreKind::Sqlite {
                return Err(anyhow::anyhow!("集群模式需要持久化存储"));
            }
            if self.lock_handler == LockHandlerKind::InProcess {
                return Err(anyhow::anyhow!("集群模式不能使用进程内锁"));
            }
            if self.cluster_checkin_interval_ms == 0 {
                return Err(anyhow::anyhow!("集群签到间隔必须大于0"));
            }
        }
        if self.max_lock_retry == 0 {
            return Err(anyhow::anyhow!("获取锁的最大重试次数必须大于0"));
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    /// `pretty` 或 `json`
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingSection {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.level,
                valid_levels
            ));
        }
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志格式: {}，支持的格式: {:?}",
                self.format,
                valid_formats
            ));
        }
        Ok(())
    }
}
