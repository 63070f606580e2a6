use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("作业存储错误: {0}")]
    JobPersistence(String),

    #[error("对象已存在: {0}")]
    ObjectAlreadyExists(String),

    #[error("作业未找到: {0}")]
    JobNotFound(String),

    #[error("日历未找到: {0}")]
    CalendarNotFound(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("无效的调度规则: {0}")]
    InvalidSchedule(String),

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("获取锁 {lock_name} 失败: {message}")]
    LockContention { lock_name: String, message: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("作业实例化失败: {0}")]
    JobFactory(String),

    #[error("作业执行已被拒绝: {0}")]
    JobRejected(String),

    #[error("调度器已关闭")]
    SchedulerShutdown,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// 作业失败时请求调度器采取的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobErrorDirective {
    /// 不额外处理，按触发器是否还能再次触发决定
    #[default]
    None,
    /// 使用同一触发上下文立即重新执行
    RefireImmediately,
    UnscheduleFiringTrigger,
    UnscheduleAllTriggers,
    MarkTriggerError,
    MarkAllTriggersError,
}

/// 作业执行返回的错误
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    pub directive: JobErrorDirective,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            directive: JobErrorDirective::None,
        }
    }

    pub fn with_directive(mut self, directive: JobErrorDirective) -> Self {
        self.directive = directive;
        self
    }

    pub fn refire_immediately(message: impl Into<String>) -> Self {
        Self::new(message).with_directive(JobErrorDirective::RefireImmediately)
    }

    pub fn unschedule_firing_trigger(message: impl Into<String>) -> Self {
        Self::new(message).with_directive(JobErrorDirective::UnscheduleFiringTrigger)
    }

    pub fn unschedule_all_triggers(message: impl Into<String>) -> Self {
        Self::new(message).with_directive(JobErrorDirective::UnscheduleAllTriggers)
    }
}

impl From<SchedulerError> for JobExecutionError {
    fn from(err: SchedulerError) -> Self {
        JobExecutionError::new(err.to_string())
    }
}
