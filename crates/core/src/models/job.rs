use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{JobDataMap, JobKey, DEFAULT_GROUP};
use crate::{SchedulerError, SchedulerResult};

/// 作业定义：描述“执行什么”，与“何时执行”的触发器分离
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    pub description: Option<String>,
    /// 由作业工厂解析的作业类型标识
    pub job_type: String,
    pub data_map: JobDataMap,
    /// 没有触发器引用时仍然保留
    pub durable: bool,
    /// 执行中途实例崩溃时需要重新执行
    pub requests_recovery: bool,
    pub concurrent_execution_disallowed: bool,
    pub persist_data_after_execution: bool,
}

impl JobDetail {
    pub fn builder(job_type: impl Into<String>) -> JobBuilder {
        JobBuilder::new(job_type)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.key.name().trim().is_empty() {
            return Err(SchedulerError::Validation("作业名称不能为空".to_string()));
        }
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::Validation(format!(
                "作业 {} 未指定作业类型",
                self.key
            )));
        }
        Ok(())
    }
}

/// JobDetail 构建器
#[derive(Debug, Clone)]
pub struct JobBuilder {
    key: Option<JobKey>,
    description: Option<String>,
    job_type: String,
    data_map: JobDataMap,
    durable: bool,
    requests_recovery: bool,
    concurrent_execution_disallowed: bool,
    persist_data_after_execution: bool,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            key: None,
            description: None,
            job_type: job_type.into(),
            data_map: JobDataMap::new(),
            durable: false,
            requests_recovery: false,
            concurrent_execution_disallowed: false,
            persist_data_after_execution: false,
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.key = Some(JobKey::new(name, group));
        self
    }

    pub fn with_key(mut self, key: JobKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn using_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data_map.put(key, value);
        self
    }

    pub fn with_data_map(mut self, data_map: JobDataMap) -> Self {
        self.data_map = data_map;
        self
    }

    pub fn store_durably(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    pub fn disallow_concurrent_execution(mut self, disallowed: bool) -> Self {
        self.concurrent_execution_disallowed = disallowed;
        self
    }

    pub fn persist_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_data_after_execution = persist;
        self
    }

    pub fn build(self) -> JobDetail {
        JobDetail {
            key: self.key.unwrap_or_else(|| JobKey::unique(DEFAULT_GROUP)),
            description: self.description,
            job_type: self.job_type,
            data_map: self.data_map,
            durable: self.durable,
            requests_recovery: self.requests_recovery,
            concurrent_execution_disallowed: self.concurrent_execution_disallowed,
            persist_data_after_execution: self.persist_data_after_execution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let job = JobDetail::builder("noop").build();
        assert_eq!(job.key.group(), DEFAULT_GROUP);
        assert!(!job.durable);
        assert!(!job.concurrent_execution_disallowed);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_type() {
        let job = JobDetail::builder("").with_identity("j", "g").build();
        assert!(matches!(job.validate(), Err(SchedulerError::Validation(_))));
    }
}
