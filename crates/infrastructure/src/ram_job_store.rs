use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::config::JobStoreSection;
use scheduler_core::{
    Calendar, CompletedExecutionInstruction, FiredTriggerRecord, FiredTriggerState, GroupMatcher,
    JobDetail, JobKey, JobStore, MisfireInstruction, NoopSignaler, SchedulerError,
    SchedulerResult, SchedulerSignaler, StringOperator, Trigger, TriggerFiredBundle,
    TriggerFiredResult, TriggerKey, TriggerState,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::observability::{MetricsCollector, StructuredLogger};
use crate::recovery::recovery_trigger;

/// 内存中触发器的内部状态，比对外暴露的 [`TriggerState`] 更细
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InternalState {
    Waiting,
    Acquired,
    Complete,
    Paused,
    Blocked,
    PausedBlocked,
    Error,
}

impl InternalState {
    fn external(self) -> TriggerState {
        match self {
            InternalState::Waiting | InternalState::Acquired => TriggerState::Normal,
            InternalState::Complete => TriggerState::Complete,
            InternalState::Paused | InternalState::PausedBlocked => TriggerState::Paused,
            InternalState::Blocked => TriggerState::Blocked,
            InternalState::Error => TriggerState::Error,
        }
    }
}

/// 时间索引项：按下次触发时间升序、优先级降序、键升序排列
#[derive(Debug, Clone, PartialEq, Eq)]
struct TimeIndexEntry {
    next_fire_time: DateTime<Utc>,
    priority: i32,
    key: TriggerKey,
}

impl Ord for TimeIndexEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.next_fire_time
            .cmp(&other.next_fire_time)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for TimeIndexEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct TriggerWrapper {
    trigger: Trigger,
    state: InternalState,
    /// 当前在时间索引中的条目
    indexed: Option<TimeIndexEntry>,
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<JobKey, JobDetail>,
    triggers: HashMap<TriggerKey, TriggerWrapper>,
    triggers_by_job: HashMap<JobKey, BTreeSet<TriggerKey>>,
    calendars: BTreeMap<String, Calendar>,
    time_index: BTreeSet<TimeIndexEntry>,
    paused_trigger_groups: BTreeSet<String>,
    paused_job_groups: BTreeSet<String>,
    blocked_jobs: HashSet<JobKey>,
    fired_triggers: HashMap<String, FiredTriggerRecord>,
}

impl StoreState {
    fn index(&mut self, key: &TriggerKey) {
        self.unindex(key);
        let Some(wrapper) = self.triggers.get_mut(key) else {
            return;
        };
        if let Some(next_fire_time) = wrapper.trigger.next_fire_time() {
            let entry = TimeIndexEntry {
                next_fire_time,
                priority: wrapper.trigger.priority,
                key: key.clone(),
            };
            self.time_index.insert(entry.clone());
            wrapper.indexed = Some(entry);
        }
    }

    /// 返回触发器之前是否在索引中
    fn unindex(&mut self, key: &TriggerKey) -> bool {
        match self
            .triggers
            .get_mut(key)
            .and_then(|wrapper| wrapper.indexed.take())
        {
            Some(entry) => self.time_index.remove(&entry),
            None => false,
        }
    }

    fn job_triggers(&self, job_key: &JobKey) -> Vec<TriggerKey> {
        self.triggers_by_job
            .get(job_key)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn is_trigger_group_paused(&self, trigger: &Trigger) -> bool {
        self.paused_trigger_groups.contains(trigger.key.group())
            || self.paused_job_groups.contains(trigger.job_key.group())
    }

    fn trigger_keys(&self, matcher: &GroupMatcher) -> BTreeSet<TriggerKey> {
        self.triggers
            .keys()
            .filter(|key| matcher.is_match(key.group()))
            .cloned()
            .collect()
    }

    fn job_keys(&self, matcher: &GroupMatcher) -> BTreeSet<JobKey> {
        self.jobs
            .keys()
            .filter(|key| matcher.is_match(key.group()))
            .cloned()
            .collect()
    }

    fn trigger_group_names(&self) -> BTreeSet<String> {
        self.triggers
            .keys()
            .map(|key| key.group().to_string())
            .collect()
    }

    fn job_group_names(&self) -> BTreeSet<String> {
        self.jobs.keys().map(|key| key.group().to_string()).collect()
    }

    fn set_state(&mut self, key: &TriggerKey, state: InternalState) {
        if state != InternalState::Waiting {
            self.unindex(key);
        }
        if let Some(wrapper) = self.triggers.get_mut(key) {
            wrapper.state = state;
        }
        if state == InternalState::Waiting {
            self.index(key);
        }
    }

    fn calendar_for(&self, trigger: &Trigger) -> Option<Calendar> {
        trigger
            .calendar_name
            .as_ref()
            .and_then(|name| self.calendars.get(name))
            .cloned()
    }
}

/// 内存作业存储
///
/// 所有数据保存在进程内，重启即丢失。全部操作在同一把异步互斥锁下完成，
/// 因此获取、触发和完成对并发调用方是原子的。
pub struct RamJobStore {
    state: Mutex<StoreState>,
    signaler: OnceLock<Arc<dyn SchedulerSignaler>>,
    instance_id: String,
    misfire_threshold: Duration,
    fire_sequence: AtomicU64,
    recovery_sequence: AtomicU64,
    metrics: MetricsCollector,
}

impl RamJobStore {
    pub fn new(instance_id: impl Into<String>, misfire_threshold: Duration) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            signaler: OnceLock::new(),
            instance_id: instance_id.into(),
            misfire_threshold,
            fire_sequence: AtomicU64::new(Utc::now().timestamp_millis().max(0) as u64),
            recovery_sequence: AtomicU64::new(0),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn from_config(config: &JobStoreSection, instance_id: impl Into<String>) -> Self {
        Self::new(instance_id, config.misfire_threshold())
    }

    pub fn misfire_threshold(&self) -> Duration {
        self.misfire_threshold
    }

    fn signaler(&self) -> Arc<dyn SchedulerSignaler> {
        self.signaler
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopSignaler))
    }

    fn next_fire_instance_id(&self) -> String {
        let sequence = self.fire_sequence.fetch_add(1, AtomicOrdering::SeqCst);
        format!("{}{}", self.instance_id, sequence)
    }

    fn store_job_locked(
        &self,
        state: &mut StoreState,
        job: &JobDetail,
        replace_existing: bool,
    ) -> SchedulerResult<()> {
        job.validate()?;
        if state.jobs.contains_key(&job.key) && !replace_existing {
            return Err(SchedulerError::ObjectAlreadyExists(format!(
                "作业 {} 已存在",
                job.key
            )));
        }
        state.jobs.insert(job.key.clone(), job.clone());
        Ok(())
    }

    fn store_trigger_locked(
        &self,
        state: &mut StoreState,
        trigger: &Trigger,
        replace_existing: bool,
    ) -> SchedulerResult<()> {
        trigger.validate()?;
        if state.triggers.contains_key(&trigger.key) {
            if !replace_existing {
                return Err(SchedulerError::ObjectAlreadyExists(format!(
                    "触发器 {} 已存在",
                    trigger.key
                )));
            }
            self.remove_trigger_locked(state, &trigger.key, false);
        }

        if !state.jobs.contains_key(&trigger.job_key) {
            return Err(SchedulerError::JobNotFound(format!(
                "触发器 {} 引用的作业 {} 不存在",
                trigger.key, trigger.job_key
            )));
        }

        let blocked = state.blocked_jobs.contains(&trigger.job_key);
        let initial = if state.is_trigger_group_paused(trigger) {
            if blocked {
                InternalState::PausedBlocked
            } else {
                InternalState::Paused
            }
        } else if blocked {
            InternalState::Blocked
        } else {
            InternalState::Waiting
        };

        let mut stored = trigger.clone();
        stored.fire_instance_id = None;
        state.triggers.insert(
            trigger.key.clone(),
            TriggerWrapper {
                trigger: stored,
                state: initial,
                indexed: None,
            },
        );
        state
            .triggers_by_job
            .entry(trigger.job_key.clone())
            .or_default()
            .insert(trigger.key.clone());
        if initial == InternalState::Waiting {
            state.index(&trigger.key);
        }
        Ok(())
    }

    /// 删除触发器；`remove_orphaned_job` 时顺带删除失去全部触发器的非持久作业
    fn remove_trigger_locked(
        &self,
        state: &mut StoreState,
        key: &TriggerKey,
        remove_orphaned_job: bool,
    ) -> Option<Trigger> {
        state.unindex(key);
        let wrapper = state.triggers.remove(key)?;
        let job_key = wrapper.trigger.job_key.clone();

        let orphaned = match state.triggers_by_job.get_mut(&job_key) {
            Some(keys) => {
                keys.remove(key);
                keys.is_empty()
            }
            None => true,
        };
        if orphaned {
            state.triggers_by_job.remove(&job_key);
        }

        if remove_orphaned_job && orphaned {
            let durable = state.jobs.get(&job_key).map(|job| job.durable);
            if durable == Some(false) {
                state.jobs.remove(&job_key);
                debug!("非持久作业 {} 已无触发器，随之删除", job_key);
                self.signaler()
                    .notify_scheduler_listeners_job_deleted(&job_key);
            }
        }
        Some(wrapper.trigger)
    }

    /// 处理错过触发；返回下一次触发时间是否被修改
    fn apply_misfire(&self, state: &mut StoreState, key: &TriggerKey, now: DateTime<Utc>) -> bool {
        let misfire_time = if self.misfire_threshold > Duration::zero() {
            now - self.misfire_threshold
        } else {
            now
        };

        let Some(wrapper) = state.triggers.get(key) else {
            return false;
        };
        let Some(original_next) = wrapper.trigger.next_fire_time() else {
            return false;
        };
        if original_next > misfire_time
            || wrapper.trigger.misfire_instruction == MisfireInstruction::IgnoreMisfirePolicy
        {
            return false;
        }

        let calendar = state.calendar_for(&wrapper.trigger);
        self.signaler()
            .notify_trigger_listeners_misfired(&wrapper.trigger);
        self.metrics.record_misfire();

        let Some(wrapper) = state.triggers.get_mut(key) else {
            return false;
        };
        wrapper.trigger.update_after_misfire(calendar.as_ref(), now);
        let new_next = wrapper.trigger.next_fire_time();
        StructuredLogger::log_trigger_misfired(key, Some(original_next), new_next);

        match new_next {
            None => {
                let finalized = wrapper.trigger.clone();
                state.set_state(key, InternalState::Complete);
                self.signaler()
                    .notify_scheduler_listeners_finalized(&finalized);
                true
            }
            Some(next) => next != original_next,
        }
    }

    fn pause_trigger_locked(&self, state: &mut StoreState, key: &TriggerKey) {
        let Some(current) = state.triggers.get(key).map(|wrapper| wrapper.state) else {
            return;
        };
        let paused = match current {
            InternalState::Complete => return,
            InternalState::Blocked | InternalState::PausedBlocked => InternalState::PausedBlocked,
            _ => InternalState::Paused,
        };
        state.set_state(key, paused);
    }

    fn resume_trigger_locked(&self, state: &mut StoreState, key: &TriggerKey, now: DateTime<Utc>) {
        let Some(wrapper) = state.triggers.get(key) else {
            return;
        };
        if !matches!(
            wrapper.state,
            InternalState::Paused | InternalState::PausedBlocked
        ) {
            return;
        }

        let resumed = if state.blocked_jobs.contains(&wrapper.trigger.job_key) {
            InternalState::Blocked
        } else {
            InternalState::Waiting
        };
        if let Some(wrapper) = state.triggers.get_mut(key) {
            wrapper.state = resumed;
        }
        self.apply_misfire(state, key, now);
        if state.triggers.get(key).map(|wrapper| wrapper.state) == Some(InternalState::Waiting) {
            state.index(key);
        }
    }

    fn pause_triggers_locked(&self, state: &mut StoreState, matcher: &GroupMatcher) -> Vec<String> {
        let mut paused_groups = Vec::new();
        if let Some(group) = matcher.exact_value() {
            if state.paused_trigger_groups.insert(group.to_string()) {
                paused_groups.push(group.to_string());
            }
        } else {
            for group in state.trigger_group_names() {
                if matcher.is_match(&group) && state.paused_trigger_groups.insert(group.clone()) {
                    paused_groups.push(group);
                }
            }
        }

        for group in &paused_groups {
            for key in state.trigger_keys(&GroupMatcher::equals(group.as_str())) {
                self.pause_trigger_locked(state, &key);
            }
        }
        paused_groups
    }

    fn resume_triggers_locked(
        &self,
        state: &mut StoreState,
        matcher: &GroupMatcher,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut groups = BTreeSet::new();
        for key in state.trigger_keys(matcher) {
            let job_group_paused = state
                .triggers
                .get(&key)
                .map(|wrapper| state.paused_job_groups.contains(wrapper.trigger.job_key.group()))
                .unwrap_or(false);
            if job_group_paused {
                continue;
            }
            groups.insert(key.group().to_string());
            self.resume_trigger_locked(state, &key, now);
        }

        let matching_paused: Vec<String> = state
            .paused_trigger_groups
            .iter()
            .filter(|group| matcher.is_match(group))
            .cloned()
            .collect();
        for group in matching_paused {
            state.paused_trigger_groups.remove(&group);
            groups.insert(group);
        }
        groups.into_iter().collect()
    }

    fn set_all_job_triggers_state(
        &self,
        state: &mut StoreState,
        job_key: &JobKey,
        target: InternalState,
    ) {
        for key in state.job_triggers(job_key) {
            state.set_state(&key, target);
        }
    }

    fn acquire_locked(
        &self,
        state: &mut StoreState,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> Vec<Trigger> {
        let now = Utc::now();
        let batch_end = no_later_than + time_window;
        let mut acquired = Vec::new();
        let mut acquired_non_concurrent_jobs = HashSet::new();
        let mut excluded = Vec::new();

        while acquired.len() < max_count {
            let Some(entry) = state.time_index.pop_first() else {
                break;
            };
            let key = entry.key;
            let Some(wrapper) = state.triggers.get_mut(&key) else {
                continue;
            };
            wrapper.indexed = None;
            if wrapper.trigger.next_fire_time().is_none() {
                continue;
            }

            if self.apply_misfire(state, &key, now) {
                if state.triggers.get(&key).map(|wrapper| wrapper.state)
                    == Some(InternalState::Waiting)
                {
                    state.index(&key);
                }
                continue;
            }

            let Some(wrapper) = state.triggers.get(&key) else {
                continue;
            };
            if wrapper.trigger.next_fire_time().is_some_and(|next| next > batch_end) {
                state.index(&key);
                break;
            }

            let job_key = wrapper.trigger.job_key.clone();
            let disallows_concurrency = state
                .jobs
                .get(&job_key)
                .map(|job| job.concurrent_execution_disallowed)
                .unwrap_or(false);
            if disallows_concurrency {
                if acquired_non_concurrent_jobs.contains(&job_key) {
                    excluded.push(key);
                    continue;
                }
                acquired_non_concurrent_jobs.insert(job_key.clone());
            }

            let fire_instance_id = self.next_fire_instance_id();
            let requests_recovery = state
                .jobs
                .get(&job_key)
                .map(|job| job.requests_recovery)
                .unwrap_or(false);
            let Some(wrapper) = state.triggers.get_mut(&key) else {
                continue;
            };
            wrapper.state = InternalState::Acquired;
            wrapper.trigger.fire_instance_id = Some(fire_instance_id.clone());
            let scheduled_time = wrapper.trigger.next_fire_time().unwrap_or(now);
            state.fired_triggers.insert(
                fire_instance_id.clone(),
                FiredTriggerRecord {
                    fire_instance_id: fire_instance_id.clone(),
                    trigger_key: key.clone(),
                    job_key,
                    instance_id: self.instance_id.clone(),
                    fired_time: now,
                    scheduled_time,
                    priority: wrapper.trigger.priority,
                    state: FiredTriggerState::Acquired,
                    concurrent_execution_disallowed: disallows_concurrency,
                    requests_recovery,
                },
            );
            StructuredLogger::log_trigger_acquired(
                &key,
                &fire_instance_id,
                wrapper.trigger.next_fire_time(),
            );
            acquired.push(wrapper.trigger.clone());
        }

        for key in excluded {
            state.index(&key);
        }
        self.metrics.record_triggers_acquired(acquired.len());
        acquired
    }

    fn trigger_fired_locked(
        &self,
        state: &mut StoreState,
        acquired: &Trigger,
        now: DateTime<Utc>,
    ) -> TriggerFiredResult {
        let Some(wrapper) = state.triggers.get(&acquired.key) else {
            return TriggerFiredResult::Skipped;
        };
        if wrapper.state != InternalState::Acquired {
            return TriggerFiredResult::Skipped;
        }

        let calendar_name = wrapper.trigger.calendar_name.clone();
        let job_key = wrapper.trigger.job_key.clone();
        let calendar = match calendar_name {
            Some(name) => match state.calendars.get(&name).cloned() {
                Some(calendar) => Some(calendar),
                None => {
                    let message = format!("触发器 {} 引用的日历 {} 不存在", acquired.key, name);
                    warn!("{}，置为 ERROR 状态", message);
                    if let Some(id) = &acquired.fire_instance_id {
                        state.fired_triggers.remove(id);
                    }
                    state.set_state(&acquired.key, InternalState::Error);
                    return TriggerFiredResult::Failed(SchedulerError::CalendarNotFound(name));
                }
            },
            None => None,
        };
        let Some(job) = state.jobs.get(&job_key).cloned() else {
            return TriggerFiredResult::Skipped;
        };

        if self.apply_misfire(state, &acquired.key, now) {
            if let Some(id) = &acquired.fire_instance_id {
                state.fired_triggers.remove(id);
            }
            if state.triggers.get(&acquired.key).map(|wrapper| wrapper.state)
                == Some(InternalState::Acquired)
            {
                state.set_state(&acquired.key, InternalState::Waiting);
            }
            self.signaler().signal_scheduling_change(None);
            return TriggerFiredResult::Skipped;
        }

        let Some(wrapper) = state.triggers.get_mut(&acquired.key) else {
            return TriggerFiredResult::Skipped;
        };
        let scheduled_fire_time = wrapper.trigger.next_fire_time();
        let previous_fire_time = wrapper.trigger.previous_fire_time();
        wrapper.trigger.triggered(calendar.as_ref());
        wrapper.state = InternalState::Waiting;
        let fired = wrapper.trigger.clone();

        if let Some(record) = fired
            .fire_instance_id
            .as_ref()
            .and_then(|id| state.fired_triggers.get_mut(id))
        {
            record.state = FiredTriggerState::Executing;
            record.fired_time = now;
        }

        if job.concurrent_execution_disallowed {
            for sibling in state.job_triggers(&job.key) {
                match state.triggers.get(&sibling).map(|wrapper| wrapper.state) {
                    Some(InternalState::Waiting) => {
                        state.set_state(&sibling, InternalState::Blocked)
                    }
                    Some(InternalState::Paused) => {
                        state.set_state(&sibling, InternalState::PausedBlocked)
                    }
                    _ => {}
                }
            }
            state.blocked_jobs.insert(job.key.clone());
        } else if fired.next_fire_time().is_some() {
            state.index(&fired.key);
        }

        StructuredLogger::log_trigger_fired(
            &fired.key,
            &job.key,
            fired.fire_instance_id.as_deref().unwrap_or_default(),
            scheduled_fire_time,
            fired.next_fire_time(),
        );
        self.metrics.record_trigger_fired();

        TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
            recovering: fired.is_recovering(),
            next_fire_time: fired.next_fire_time(),
            job_detail: job,
            trigger: fired,
            calendar,
            fire_time: now,
            scheduled_fire_time,
            previous_fire_time,
        }))
    }

    fn recover_locked(&self, state: &mut StoreState) -> usize {
        let now = Utc::now();
        let keys: Vec<TriggerKey> = state.triggers.keys().cloned().collect();

        for key in &keys {
            match state.triggers.get(key).map(|wrapper| wrapper.state) {
                Some(InternalState::Acquired) | Some(InternalState::Blocked) => {
                    state.set_state(key, InternalState::Waiting)
                }
                Some(InternalState::PausedBlocked) => state.set_state(key, InternalState::Paused),
                _ => {}
            }
        }
        state.blocked_jobs.clear();

        for key in &keys {
            if state.triggers.get(key).map(|wrapper| wrapper.state) == Some(InternalState::Waiting)
            {
                self.apply_misfire(state, key, now);
            }
        }

        let records: Vec<FiredTriggerRecord> = state
            .fired_triggers
            .drain()
            .map(|(_, record)| record)
            .collect();
        let mut recovered = 0;
        for record in records {
            if !record.requests_recovery || !state.jobs.contains_key(&record.job_key) {
                continue;
            }
            let original_data = state
                .triggers
                .get(&record.trigger_key)
                .map(|wrapper| wrapper.trigger.data_map.clone());
            let sequence = self.recovery_sequence.fetch_add(1, AtomicOrdering::SeqCst);
            let trigger = recovery_trigger(&record, original_data.as_ref(), sequence);
            match self.store_trigger_locked(state, &trigger, false) {
                Ok(()) => recovered += 1,
                Err(e) => warn!("为作业 {} 创建恢复触发器失败: {}", record.job_key, e),
            }
        }

        let complete: Vec<TriggerKey> = state
            .triggers
            .iter()
            .filter(|(_, wrapper)| wrapper.state == InternalState::Complete)
            .map(|(key, _)| key.clone())
            .collect();
        for key in complete {
            self.remove_trigger_locked(state, &key, true);
        }

        self.metrics.record_recovered_jobs(recovered);
        recovered
    }
}

#[async_trait]
impl JobStore for RamJobStore {
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> SchedulerResult<()> {
        if self.signaler.set(signaler).is_err() {
            warn!("内存作业存储重复初始化，忽略新的回调接口");
        }
        info!("内存作业存储初始化完成，实例: {}", self.instance_id);
        Ok(())
    }

    async fn scheduler_started(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let recovered = self.recover_locked(&mut state);
        if recovered > 0 {
            info!("启动恢复完成，创建了 {} 个恢复触发器", recovered);
        }
        Ok(())
    }

    async fn shutdown(&self) -> SchedulerResult<()> {
        debug!("内存作业存储关闭");
        Ok(())
    }

    fn supports_persistence(&self) -> bool {
        false
    }

    fn estimated_time_to_release_and_acquire_trigger(&self) -> Duration {
        Duration::milliseconds(5)
    }

    async fn store_job_and_trigger(
        &self,
        job: &JobDetail,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if state.triggers.contains_key(&trigger.key) {
            return Err(SchedulerError::ObjectAlreadyExists(format!(
                "触发器 {} 已存在",
                trigger.key
            )));
        }
        self.store_job_locked(&mut state, job, false)?;
        if let Err(e) = self.store_trigger_locked(&mut state, trigger, false) {
            state.jobs.remove(&job.key);
            return Err(e);
        }
        Ok(())
    }

    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.store_job_locked(&mut state, job, replace_existing)
    }

    async fn store_jobs_and_triggers(
        &self,
        jobs: &[(JobDetail, Vec<Trigger>)],
        replace: bool,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if !replace {
            for (job, triggers) in jobs {
                if state.jobs.contains_key(&job.key) {
                    return Err(SchedulerError::ObjectAlreadyExists(format!(
                        "作业 {} 已存在",
                        job.key
                    )));
                }
                if let Some(trigger) = triggers
                    .iter()
                    .find(|trigger| state.triggers.contains_key(&trigger.key))
                {
                    return Err(SchedulerError::ObjectAlreadyExists(format!(
                        "触发器 {} 已存在",
                        trigger.key
                    )));
                }
            }
        }
        for (job, triggers) in jobs {
            self.store_job_locked(&mut state, job, true)?;
            for trigger in triggers {
                self.store_trigger_locked(&mut state, trigger, true)?;
            }
        }
        Ok(())
    }

    async fn remove_job(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let mut found = false;
        for key in state.job_triggers(job_key) {
            self.remove_trigger_locked(&mut state, &key, false);
            found = true;
        }
        state.triggers_by_job.remove(job_key);
        Ok(state.jobs.remove(job_key).is_some() || found)
    }

    async fn retrieve_job(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        Ok(self.state.lock().await.jobs.get(job_key).cloned())
    }

    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.store_trigger_locked(&mut state, trigger, replace_existing)
    }

    async fn remove_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        Ok(self
            .remove_trigger_locked(&mut state, trigger_key, true)
            .is_some())
    }

    async fn replace_trigger(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let Some(old_job_key) = state
            .triggers
            .get(trigger_key)
            .map(|wrapper| wrapper.trigger.job_key.clone())
        else {
            return Ok(false);
        };
        if old_job_key != new_trigger.job_key {
            return Err(SchedulerError::JobPersistence(format!(
                "新触发器 {} 与旧触发器 {} 不属于同一作业",
                new_trigger.key, trigger_key
            )));
        }
        new_trigger.validate()?;
        self.remove_trigger_locked(&mut state, trigger_key, false);
        self.store_trigger_locked(&mut state, new_trigger, false)?;
        Ok(true)
    }

    async fn retrieve_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        Ok(self
            .state
            .lock()
            .await
            .triggers
            .get(trigger_key)
            .map(|wrapper| wrapper.trigger.clone()))
    }

    async fn get_trigger_state(&self, trigger_key: &TriggerKey) -> SchedulerResult<TriggerState> {
        Ok(self
            .state
            .lock()
            .await
            .triggers
            .get(trigger_key)
            .map(|wrapper| wrapper.state.external())
            .unwrap_or(TriggerState::None))
    }

    async fn reset_trigger_from_error_state(
        &self,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let Some(wrapper) = state.triggers.get(trigger_key) else {
            return Ok(());
        };
        if wrapper.state != InternalState::Error {
            return Ok(());
        }
        let target = if state.is_trigger_group_paused(&wrapper.trigger) {
            InternalState::Paused
        } else {
            InternalState::Waiting
        };
        state.set_state(trigger_key, target);
        Ok(())
    }

    async fn get_triggers_for_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        let state = self.state.lock().await;
        Ok(state
            .job_triggers(job_key)
            .iter()
            .filter_map(|key| state.triggers.get(key))
            .map(|wrapper| wrapper.trigger.clone())
            .collect())
    }

    async fn clear_all_scheduling_data(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        *state = StoreState::default();
        info!("内存作业存储已清空");
        Ok(())
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        if state.calendars.contains_key(name) && !replace_existing {
            return Err(SchedulerError::ObjectAlreadyExists(format!(
                "日历 {} 已存在",
                name
            )));
        }
        state.calendars.insert(name.to_string(), calendar.clone());

        if update_triggers {
            let now = Utc::now();
            let affected: Vec<TriggerKey> = state
                .triggers
                .iter()
                .filter(|(_, wrapper)| wrapper.trigger.calendar_name.as_deref() == Some(name))
                .map(|(key, _)| key.clone())
                .collect();
            for key in affected {
                let was_indexed = state.unindex(&key);
                if let Some(wrapper) = state.triggers.get_mut(&key) {
                    wrapper.trigger.update_with_new_calendar(
                        Some(calendar),
                        self.misfire_threshold,
                        now,
                    );
                }
                if was_indexed {
                    state.index(&key);
                }
            }
        }
        Ok(())
    }

    async fn remove_calendar(&self, name: &str) -> SchedulerResult<bool> {
        let mut state = self.state.lock().await;
        let referenced = state
            .triggers
            .values()
            .any(|wrapper| wrapper.trigger.calendar_name.as_deref() == Some(name));
        if referenced {
            return Err(SchedulerError::JobPersistence(format!(
                "日历 {} 仍被触发器引用，无法删除",
                name
            )));
        }
        Ok(state.calendars.remove(name).is_some())
    }

    async fn retrieve_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        Ok(self.state.lock().await.calendars.get(name).cloned())
    }

    async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.state.lock().await.calendars.keys().cloned().collect())
    }

    async fn get_number_of_jobs(&self) -> SchedulerResult<usize> {
        Ok(self.state.lock().await.jobs.len())
    }

    async fn get_number_of_triggers(&self) -> SchedulerResult<usize> {
        Ok(self.state.lock().await.triggers.len())
    }

    async fn get_number_of_calendars(&self) -> SchedulerResult<usize> {
        Ok(self.state.lock().await.calendars.len())
    }

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> SchedulerResult<BTreeSet<JobKey>> {
        Ok(self.state.lock().await.job_keys(matcher))
    }

    async fn get_trigger_keys(
        &self,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<BTreeSet<TriggerKey>> {
        Ok(self.state.lock().await.trigger_keys(matcher))
    }

    async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.state.lock().await.job_group_names().into_iter().collect())
    }

    async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .await
            .trigger_group_names()
            .into_iter()
            .collect())
    }

    async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.pause_trigger_locked(&mut state, trigger_key);
        Ok(())
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        let mut state = self.state.lock().await;
        Ok(self.pause_triggers_locked(&mut state, matcher))
    }

    async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        for key in state.job_triggers(job_key) {
            self.pause_trigger_locked(&mut state, &key);
        }
        Ok(())
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let mut paused_groups = Vec::new();
        if matcher.operator == StringOperator::Equals {
            if state.paused_job_groups.insert(matcher.value.clone()) {
                paused_groups.push(matcher.value.clone());
            }
        } else {
            for group in state.job_group_names() {
                if matcher.is_match(&group) && state.paused_job_groups.insert(group.clone()) {
                    paused_groups.push(group);
                }
            }
        }

        for group in &paused_groups {
            for job_key in state.job_keys(&GroupMatcher::equals(group.as_str())) {
                for key in state.job_triggers(&job_key) {
                    self.pause_trigger_locked(&mut state, &key);
                }
            }
        }
        Ok(paused_groups)
    }

    async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        self.resume_trigger_locked(&mut state, trigger_key, Utc::now());
        Ok(())
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        let mut state = self.state.lock().await;
        Ok(self.resume_triggers_locked(&mut state, matcher, Utc::now()))
    }

    async fn get_paused_trigger_groups(&self) -> SchedulerResult<BTreeSet<String>> {
        Ok(self.state.lock().await.paused_trigger_groups.clone())
    }

    async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for key in state.job_triggers(job_key) {
            self.resume_trigger_locked(&mut state, &key, now);
        }
        Ok(())
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut resumed_groups = BTreeSet::new();
        for job_key in state.job_keys(matcher) {
            resumed_groups.insert(job_key.group().to_string());
            for key in state.job_triggers(&job_key) {
                self.resume_trigger_locked(&mut state, &key, now);
            }
        }
        let matching_paused: Vec<String> = state
            .paused_job_groups
            .iter()
            .filter(|group| matcher.is_match(group))
            .cloned()
            .collect();
        for group in matching_paused {
            state.paused_job_groups.remove(&group);
            resumed_groups.insert(group);
        }
        Ok(resumed_groups.into_iter().collect())
    }

    async fn pause_all(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        for group in state.trigger_group_names() {
            self.pause_triggers_locked(&mut state, &GroupMatcher::equals(group));
        }
        Ok(())
    }

    async fn resume_all(&self) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        state.paused_job_groups.clear();
        self.resume_triggers_locked(&mut state, &GroupMatcher::any(), Utc::now());
        Ok(())
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        let mut state = self.state.lock().await;
        Ok(self.acquire_locked(&mut state, no_later_than, max_count.max(1), time_window))
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let Some(id) = &trigger.fire_instance_id else {
            return Ok(());
        };
        // 已进入执行的记录由完成回写删除，崩溃恢复依赖它
        let still_acquired = state.fired_triggers.get(id).is_some_and(|record| {
            record.state == FiredTriggerState::Acquired && record.trigger_key == trigger.key
        });
        if still_acquired {
            state.fired_triggers.remove(id);
        }
        let acquired = state
            .triggers
            .get(&trigger.key)
            .map(|wrapper| {
                wrapper.state == InternalState::Acquired
                    && wrapper.trigger.fire_instance_id.as_ref() == Some(id)
            })
            .unwrap_or(false);
        if acquired {
            if let Some(wrapper) = state.triggers.get_mut(&trigger.key) {
                wrapper.trigger.fire_instance_id = None;
            }
            state.set_state(&trigger.key, InternalState::Waiting);
            self.metrics.record_trigger_released();
        }
        Ok(())
    }

    async fn triggers_fired(&self, triggers: &[Trigger]) -> SchedulerResult<Vec<TriggerFiredResult>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        Ok(triggers
            .iter()
            .map(|trigger| self.trigger_fired_locked(&mut state, trigger, now))
            .collect())
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().await;
        let signaler = self.signaler();

        match state.jobs.get_mut(&job.key) {
            Some(stored) => {
                if stored.persist_data_after_execution && stored.data_map != job.data_map {
                    stored.data_map = job.data_map.clone();
                }
                if stored.concurrent_execution_disallowed {
                    state.blocked_jobs.remove(&job.key);
                    for sibling in state.job_triggers(&job.key) {
                        match state.triggers.get(&sibling).map(|wrapper| wrapper.state) {
                            Some(InternalState::Blocked) => {
                                state.set_state(&sibling, InternalState::Waiting)
                            }
                            Some(InternalState::PausedBlocked) => {
                                state.set_state(&sibling, InternalState::Paused)
                            }
                            _ => {}
                        }
                    }
                    signaler.signal_scheduling_change(None);
                }
            }
            None => {
                state.blocked_jobs.remove(&job.key);
            }
        }

        if state.triggers.contains_key(&trigger.key) {
            match instruction {
                CompletedExecutionInstruction::DeleteTrigger => {
                    let stored_next = state
                        .triggers
                        .get(&trigger.key)
                        .and_then(|wrapper| wrapper.trigger.next_fire_time());
                    // 执行期间被重新调度的触发器保留
                    if trigger.next_fire_time().is_some() || stored_next.is_none() {
                        self.remove_trigger_locked(&mut state, &trigger.key, true);
                        signaler.signal_scheduling_change(None);
                    }
                }
                CompletedExecutionInstruction::SetTriggerComplete => {
                    state.set_state(&trigger.key, InternalState::Complete);
                    signaler.signal_scheduling_change(None);
                }
                CompletedExecutionInstruction::SetTriggerError => {
                    info!("触发器 {} 被置为 ERROR 状态", trigger.key);
                    state.set_state(&trigger.key, InternalState::Error);
                    signaler.signal_scheduling_change(None);
                }
                CompletedExecutionInstruction::SetAllJobTriggersError => {
                    info!("作业 {} 的全部触发器被置为 ERROR 状态", job.key);
                    self.set_all_job_triggers_state(&mut state, &job.key, InternalState::Error);
                    signaler.signal_scheduling_change(None);
                }
                CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                    self.set_all_job_triggers_state(
                        &mut state,
                        &job.key,
                        InternalState::Complete,
                    );
                    signaler.signal_scheduling_change(None);
                }
                CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {}
            }
        }

        if let Some(id) = &trigger.fire_instance_id {
            state.fired_triggers.remove(id);
        }
        Ok(())
    }

    async fn get_fired_trigger_records(&self) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<FiredTriggerRecord> = state.fired_triggers.values().cloned().collect();
        records.sort_by(|a, b| a.fire_instance_id.cmp(&b.fire_instance_id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(seconds: i64, priority: i32, name: &str) -> TimeIndexEntry {
        TimeIndexEntry {
            next_fire_time: Utc.timestamp_opt(1_900_000_000 + seconds, 0).unwrap(),
            priority,
            key: TriggerKey::new(name, "g"),
        }
    }

    #[test]
    fn test_time_index_ordering() {
        let mut index = BTreeSet::new();
        index.insert(entry(10, 5, "c"));
        index.insert(entry(0, 1, "b"));
        index.insert(entry(0, 9, "z"));
        index.insert(entry(0, 1, "a"));

        let names: Vec<&str> = index.iter().map(|e| e.key.name()).collect();
        assert_eq!(names, vec!["z", "a", "b", "c"]);
    }

    #[test]
    fn test_internal_state_mapping() {
        assert_eq!(InternalState::Acquired.external(), TriggerState::Normal);
        assert_eq!(InternalState::PausedBlocked.external(), TriggerState::Paused);
        assert_eq!(InternalState::Blocked.external(), TriggerState::Blocked);
    }
}
