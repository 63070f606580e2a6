use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use scheduler_core::{Job, JobDataMap, JobFactory, SchedulerError, SchedulerResult};
use tracing::{debug, info};

use crate::jobs::{NativeJob, NoOpJob};

/// 作业构造函数
pub type JobConstructor =
    Arc<dyn Fn(&JobDataMap) -> SchedulerResult<Box<dyn Job>> + Send + Sync>;

/// 按作业类型名注册构造函数的作业工厂
#[derive(Default)]
pub struct SimpleJobFactory {
    constructors: RwLock<HashMap<String, JobConstructor>>,
}

impl SimpleJobFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预先注册内置作业：`noop` 与 `native`
    pub fn with_builtin_jobs() -> Self {
        let factory = Self::new();
        factory.register_default::<NoOpJob>(NoOpJob::JOB_TYPE);
        factory.register(NativeJob::JOB_TYPE, |data| {
            Ok(Box::new(NativeJob::from_data(data)?) as Box<dyn Job>)
        });
        factory
    }

    pub fn register<F>(&self, job_type: impl Into<String>, constructor: F)
    where
        F: Fn(&JobDataMap) -> SchedulerResult<Box<dyn Job>> + Send + Sync + 'static,
    {
        let job_type = job_type.into();
        info!("注册作业类型: {}", job_type);
        let mut constructors = match self.constructors.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        constructors.insert(job_type, Arc::new(constructor));
    }

    /// 注册无需参数即可构造的作业
    pub fn register_default<J>(&self, job_type: impl Into<String>)
    where
        J: Job + Default + 'static,
    {
        self.register(job_type, |_| Ok(Box::new(J::default()) as Box<dyn Job>));
    }

    pub fn contains(&self, job_type: &str) -> bool {
        match self.constructors.read() {
            Ok(guard) => guard.contains_key(job_type),
            Err(poisoned) => poisoned.into_inner().contains_key(job_type),
        }
    }

    pub fn job_types(&self) -> Vec<String> {
        let constructors = match self.constructors.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut types: Vec<String> = constructors.keys().cloned().collect();
        types.sort();
        types
    }
}

impl JobFactory for SimpleJobFactory {
    fn new_job(&self, job_type: &str, data: &JobDataMap) -> SchedulerResult<Box<dyn Job>> {
        let constructor = {
            let constructors = match self.constructors.read() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            constructors.get(job_type).cloned()
        };
        match constructor {
            Some(constructor) => {
                debug!("实例化作业类型 {}", job_type);
                constructor(data)
            }
            None => Err(SchedulerError::JobFactory(format!(
                "未注册的作业类型: {job_type}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_jobs_registered() {
        let factory = SimpleJobFactory::with_builtin_jobs();
        assert_eq!(factory.job_types(), vec!["native", "noop"]);
        assert!(factory.new_job("noop", &JobDataMap::new()).is_ok());
    }

    #[test]
    fn test_unknown_job_type_is_rejected() {
        let factory = SimpleJobFactory::new();
        let err = factory
            .new_job("missing", &JobDataMap::new())
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::JobFactory(_)));
    }

    #[test]
    fn test_native_job_requires_command() {
        let factory = SimpleJobFactory::with_builtin_jobs();
        assert!(factory.new_job("native", &JobDataMap::new()).is_err());

        let mut data = JobDataMap::new();
        data.put("command", "echo");
        assert!(factory.new_job("native", &data).is_ok());
    }
}
