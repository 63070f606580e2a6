use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use scheduler_core::{
    JobKey, JobListener, Keyed, Matcher, SchedulerListener, TriggerKey, TriggerListener,
};
use tracing::info;

struct Registered<L: ?Sized, K> {
    listener: Arc<L>,
    matchers: Vec<Matcher<K>>,
}

impl<L: ?Sized, K: Keyed + PartialEq> Registered<L, K> {
    fn applies_to(&self, key: &K) -> bool {
        self.matchers.is_empty() || self.matchers.iter().any(|m| m.is_match(key))
    }
}

/// 监听器注册表
///
/// 作业监听器和触发器监听器按名称唯一，可附带匹配器（为空时匹配全部）；
/// 调度器监听器接收所有调度器事件。
#[derive(Default)]
pub struct ListenerManager {
    job_listeners: RwLock<Vec<Registered<dyn JobListener, JobKey>>>,
    trigger_listeners: RwLock<Vec<Registered<dyn TriggerListener, TriggerKey>>>,
    scheduler_listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册作业监听器，同名监听器会被替换
    pub fn add_job_listener(&self, listener: Arc<dyn JobListener>, matchers: Vec<Matcher<JobKey>>) {
        info!("注册作业监听器: {}", listener.name());
        let mut listeners = write(&self.job_listeners);
        listeners.retain(|r| r.listener.name() != listener.name());
        listeners.push(Registered { listener, matchers });
    }

    pub fn remove_job_listener(&self, name: &str) -> bool {
        let mut listeners = write(&self.job_listeners);
        let before = listeners.len();
        listeners.retain(|r| r.listener.name() != name);
        listeners.len() != before
    }

    /// 为已注册的作业监听器追加匹配器
    pub fn add_job_listener_matcher(&self, name: &str, matcher: Matcher<JobKey>) -> bool {
        let mut listeners = write(&self.job_listeners);
        match listeners.iter_mut().find(|r| r.listener.name() == name) {
            Some(registered) => {
                registered.matchers.push(matcher);
                true
            }
            None => false,
        }
    }

    pub fn job_listener_names(&self) -> Vec<String> {
        read(&self.job_listeners)
            .iter()
            .map(|r| r.listener.name().to_string())
            .collect()
    }

    pub fn add_trigger_listener(
        &self,
        listener: Arc<dyn TriggerListener>,
        matchers: Vec<Matcher<TriggerKey>>,
    ) {
        info!("注册触发器监听器: {}", listener.name());
        let mut listeners = write(&self.trigger_listeners);
        listeners.retain(|r| r.listener.name() != listener.name());
        listeners.push(Registered { listener, matchers });
    }

    pub fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut listeners = write(&self.trigger_listeners);
        let before = listeners.len();
        listeners.retain(|r| r.listener.name() != name);
        listeners.len() != before
    }

    pub fn add_trigger_listener_matcher(&self, name: &str, matcher: Matcher<TriggerKey>) -> bool {
        let mut listeners = write(&self.trigger_listeners);
        match listeners.iter_mut().find(|r| r.listener.name() == name) {
            Some(registered) => {
                registered.matchers.push(matcher);
                true
            }
            None => false,
        }
    }

    pub fn trigger_listener_names(&self) -> Vec<String> {
        read(&self.trigger_listeners)
            .iter()
            .map(|r| r.listener.name().to_string())
            .collect()
    }

    pub fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        write(&self.scheduler_listeners).push(listener);
    }

    pub fn remove_scheduler_listener(&self, listener: &Arc<dyn SchedulerListener>) -> bool {
        let mut listeners = write(&self.scheduler_listeners);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// 匹配该作业的监听器快照，回调期间不持有锁
    pub fn job_listeners_for(&self, job_key: &JobKey) -> Vec<Arc<dyn JobListener>> {
        read(&self.job_listeners)
            .iter()
            .filter(|r| r.applies_to(job_key))
            .map(|r| r.listener.clone())
            .collect()
    }

    pub fn trigger_listeners_for(&self, trigger_key: &TriggerKey) -> Vec<Arc<dyn TriggerListener>> {
        read(&self.trigger_listeners)
            .iter()
            .filter(|r| r.applies_to(trigger_key))
            .map(|r| r.listener.clone())
            .collect()
    }

    pub fn scheduler_listeners(&self) -> Vec<Arc<dyn SchedulerListener>> {
        read(&self.scheduler_listeners).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_core::StringMatcher;

    struct Named(&'static str);

    impl JobListener for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_job_listener_matchers() {
        let manager = ListenerManager::new();
        manager.add_job_listener(Arc::new(Named("all")), Vec::new());
        manager.add_job_listener(
            Arc::new(Named("reports")),
            vec![Matcher::Group(StringMatcher::equals("reports"))],
        );

        let report = JobKey::new("daily", "reports");
        let other = JobKey::new("cleanup", "maintenance");
        assert_eq!(manager.job_listeners_for(&report).len(), 2);
        assert_eq!(manager.job_listeners_for(&other).len(), 1);

        assert!(manager.add_job_listener_matcher("reports", Matcher::Key(other.clone())));
        assert_eq!(manager.job_listeners_for(&other).len(), 2);
    }

    #[test]
    fn test_same_name_replaces_and_remove() {
        let manager = ListenerManager::new();
        manager.add_job_listener(Arc::new(Named("audit")), Vec::new());
        manager.add_job_listener(Arc::new(Named("audit")), Vec::new());
        assert_eq!(manager.job_listener_names(), vec!["audit".to_string()]);

        assert!(manager.remove_job_listener("audit"));
        assert!(!manager.remove_job_listener("audit"));
        assert!(manager.job_listener_names().is_empty());
    }
}
