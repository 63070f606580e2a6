use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use scheduler_core::config::JobStoreSection;
use scheduler_core::{
    Calendar, CompletedExecutionInstruction, FiredTriggerRecord, FiredTriggerState, GroupMatcher,
    JobDetail, JobKey, JobStore, MisfireInstruction, NoopSignaler, SchedulerError,
    SchedulerResult, SchedulerSignaler, Trigger, TriggerFiredBundle, TriggerFiredResult,
    TriggerKey, TriggerState,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::delegate::{GroupKind, SqliteDelegate};
use super::mapping::RowState;
use super::schema::run_migrations;
use crate::database::lock::{semaphore_from_config, LockGuard, Semaphore, LOCK_TRIGGER_ACCESS};
use crate::observability::{MetricsCollector, StructuredLogger};
use crate::recovery::recovery_trigger;

/// 单次错过触发处理的最大触发器数
const MAX_MISFIRES_PER_PASS: usize = 20;

/// 在锁内执行写操作，成功提交、失败回滚
macro_rules! locked {
    ($self:ident, $conn:ident => $body:expr) => {{
        let (mut tx, _lock) = $self.core.begin(Some(LOCK_TRIGGER_ACCESS)).await?;
        let result = {
            let $conn: &mut SqliteConnection = &mut tx;
            $body.await
        };
        finish(tx, result).await
    }};
}

/// 只读操作，直接使用连接池中的连接
macro_rules! read {
    ($self:ident, $conn:ident => $body:expr) => {{
        let mut pooled = $self.core.pool.acquire().await?;
        let $conn: &mut SqliteConnection = &mut pooled;
        $body.await
    }};
}

pub(super) async fn finish<T>(
    tx: Transaction<'static, Sqlite>,
    result: SchedulerResult<T>,
) -> SchedulerResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!("事务回滚失败: {}", rollback_error);
            }
            Err(e)
        }
    }
}

/// 存储和集群签到任务共享的部分
pub(super) struct StoreCore {
    pub(super) pool: SqlitePool,
    pub(super) delegate: SqliteDelegate,
    pub(super) semaphore: Arc<dyn Semaphore>,
    pub(super) instance_id: String,
    pub(super) misfire_threshold: Duration,
    pub(super) clustered: bool,
    pub(super) checkin_interval: std::time::Duration,
    pub(super) acquire_triggers_within_lock: bool,
    pub(super) last_checkin_ms: AtomicI64,
    signaler: OnceLock<Arc<dyn SchedulerSignaler>>,
    fire_sequence: AtomicU64,
    recovery_sequence: AtomicU64,
    pub(super) metrics: MetricsCollector,
}

impl StoreCore {
    pub(super) fn signaler(&self) -> Arc<dyn SchedulerSignaler> {
        self.signaler
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(NoopSignaler))
    }

    pub(super) async fn begin(
        &self,
        lock_name: Option<&str>,
    ) -> SchedulerResult<(Transaction<'static, Sqlite>, Option<LockGuard>)> {
        let mut tx = self.pool.begin().await?;
        let guard = match lock_name {
            Some(name) => match self.semaphore.obtain_lock(&mut tx, name).await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    if let Err(rollback_error) = tx.rollback().await {
                        warn!("事务回滚失败: {}", rollback_error);
                    }
                    return Err(e);
                }
            },
            None => None,
        };
        Ok((tx, guard))
    }

    fn misfire_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        if self.misfire_threshold > Duration::zero() {
            now - self.misfire_threshold
        } else {
            now
        }
    }

    fn next_fire_instance_id(&self) -> String {
        let sequence = self.fire_sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}{}", self.instance_id, sequence)
    }

    // ---- 作业与触发器 ----

    async fn store_job(
        &self,
        conn: &mut SqliteConnection,
        job: &JobDetail,
        replace_existing: bool,
    ) -> SchedulerResult<()> {
        job.validate()?;
        if !replace_existing && self.delegate.job_exists(conn, &job.key).await? {
            return Err(SchedulerError::ObjectAlreadyExists(format!(
                "作业 {} 已存在",
                job.key
            )));
        }
        self.delegate.upsert_job(conn, job).await
    }

    /// 存储触发器，初始状态取决于所在分组是否暂停以及作业是否正在阻塞执行
    pub(super) async fn store_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
        replace_existing: bool,
        recovering: bool,
    ) -> SchedulerResult<()> {
        trigger.validate()?;
        if !replace_existing && self.delegate.trigger_exists(conn, &trigger.key).await? {
            return Err(SchedulerError::ObjectAlreadyExists(format!(
                "触发器 {} 已存在",
                trigger.key
            )));
        }
        let Some(job) = self.delegate.select_job(conn, &trigger.job_key).await? else {
            return Err(SchedulerError::JobNotFound(format!(
                "触发器 {} 引用的作业 {} 不存在",
                trigger.key, trigger.job_key
            )));
        };

        let paused = self
            .delegate
            .is_group_paused(conn, GroupKind::Trigger, trigger.key.group())
            .await?
            || self
                .delegate
                .is_group_paused(conn, GroupKind::Job, trigger.job_key.group())
                .await?;
        let blocked = job.concurrent_execution_disallowed
            && !recovering
            && self.delegate.job_is_executing(conn, &job.key).await?;

        let state = match (paused, blocked) {
            (true, true) => RowState::PausedBlocked,
            (true, false) => RowState::Paused,
            (false, true) => RowState::Blocked,
            (false, false) => RowState::Waiting,
        };
        self.delegate.upsert_trigger(conn, trigger, state).await
    }

    pub(super) async fn remove_trigger(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        remove_orphaned_job: bool,
    ) -> SchedulerResult<bool> {
        let Some((trigger, _)) = self.delegate.select_trigger(conn, key).await? else {
            return Ok(false);
        };
        self.delegate.delete_trigger(conn, key).await?;

        if remove_orphaned_job
            && self
                .delegate
                .count_triggers_for_job(conn, &trigger.job_key)
                .await?
                == 0
        {
            if let Some(job) = self.delegate.select_job(conn, &trigger.job_key).await? {
                if !job.durable {
                    self.delegate.delete_job(conn, &job.key).await?;
                    debug!("非持久作业 {} 已无触发器，随之删除", job.key);
                    self.signaler()
                        .notify_scheduler_listeners_job_deleted(&job.key);
                }
            }
        }
        Ok(true)
    }

    async fn remove_job(&self, conn: &mut SqliteConnection, key: &JobKey) -> SchedulerResult<bool> {
        let triggers = self.delegate.select_triggers_for_job(conn, key).await?;
        for (trigger, _) in &triggers {
            self.delegate.delete_trigger(conn, &trigger.key).await?;
        }
        let deleted = self.delegate.delete_job(conn, key).await?;
        Ok(deleted || !triggers.is_empty())
    }

    async fn replace_trigger(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool> {
        let Some((old, _)) = self.delegate.select_trigger(conn, key).await? else {
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            return Err(SchedulerError::JobPersistence(format!(
                "新触发器 {} 与旧触发器 {} 不属于同一作业",
                new_trigger.key, key
            )));
        }
        new_trigger.validate()?;
        self.delegate.delete_trigger(conn, key).await?;
        self.store_trigger(conn, new_trigger, false, false).await?;
        Ok(true)
    }

    // ---- 错过触发 ----

    /// 处理错过触发；返回下一次触发时间是否被修改，修改后的触发器由调用方写回
    pub(super) async fn apply_misfire(
        &self,
        conn: &mut SqliteConnection,
        trigger: &mut Trigger,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let Some(original_next) = trigger.next_fire_time() else {
            return Ok(false);
        };
        if original_next > self.misfire_time(now)
            || trigger.misfire_instruction == MisfireInstruction::IgnoreMisfirePolicy
        {
            return Ok(false);
        }

        let calendar = match &trigger.calendar_name {
            Some(name) => self.delegate.select_calendar(conn, name).await?,
            None => None,
        };
        self.signaler().notify_trigger_listeners_misfired(trigger);
        self.metrics.record_misfire();

        trigger.update_after_misfire(calendar.as_ref(), now);
        let new_next = trigger.next_fire_time();
        StructuredLogger::log_trigger_misfired(&trigger.key, Some(original_next), new_next);

        match new_next {
            None => {
                self.signaler().notify_scheduler_listeners_finalized(trigger);
                Ok(true)
            }
            Some(next) => Ok(next != original_next),
        }
    }

    /// 处理一批错过触发的等待中触发器，返回处理的数量
    pub(super) async fn recover_misfired(
        &self,
        conn: &mut SqliteConnection,
        now: DateTime<Utc>,
    ) -> SchedulerResult<usize> {
        let keys = self
            .delegate
            .select_misfired_triggers(conn, self.misfire_time(now), MAX_MISFIRES_PER_PASS)
            .await?;
        let mut earliest: Option<DateTime<Utc>> = None;
        for key in &keys {
            let Some((mut trigger, state)) = self.delegate.select_trigger(conn, key).await? else {
                continue;
            };
            if state != RowState::Waiting {
                continue;
            }
            self.apply_misfire(conn, &mut trigger, now).await?;
            let new_state = match trigger.next_fire_time() {
                Some(next) => {
                    earliest = Some(earliest.map_or(next, |current| current.min(next)));
                    RowState::Waiting
                }
                None => RowState::Complete,
            };
            self.delegate.upsert_trigger(conn, &trigger, new_state).await?;
        }
        if !keys.is_empty() {
            debug!("处理了 {} 个错过触发的触发器", keys.len());
            self.signaler().signal_scheduling_change(earliest);
        }
        Ok(keys.len())
    }

    // ---- 调度协议 ----

    async fn acquire_next_triggers(
        &self,
        conn: &mut SqliteConnection,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        let now = Utc::now();
        let batch_end = no_later_than + time_window;
        let candidates = self
            .delegate
            .select_triggers_to_acquire(conn, batch_end, self.misfire_time(now), max_count + 10)
            .await?;

        let mut acquired = Vec::new();
        let mut acquired_non_concurrent_jobs = HashSet::new();
        for key in candidates {
            let (mut trigger, job) = match self.select_trigger_and_job(conn, &key).await {
                Ok(Some(loaded)) => loaded,
                Ok(None) => continue,
                Err(SchedulerError::Database(e)) => return Err(SchedulerError::Database(e)),
                Err(e) => {
                    self.mark_key_error(conn, &key, &e).await?;
                    continue;
                }
            };
            if job.concurrent_execution_disallowed
                && !acquired_non_concurrent_jobs.insert(job.key.clone())
            {
                continue;
            }
            if trigger.next_fire_time().is_some_and(|next| next > batch_end) {
                break;
            }

            // 其他实例可能已经抢先获取
            let updated = self
                .delegate
                .update_trigger_state_from(conn, &key, RowState::Acquired, RowState::Waiting)
                .await?;
            if updated == 0 {
                continue;
            }

            let fire_instance_id = self.next_fire_instance_id();
            trigger.fire_instance_id = Some(fire_instance_id.clone());
            self.delegate
                .insert_fired_trigger(
                    conn,
                    &FiredTriggerRecord {
                        fire_instance_id: fire_instance_id.clone(),
                        trigger_key: key.clone(),
                        job_key: job.key.clone(),
                        instance_id: self.instance_id.clone(),
                        fired_time: now,
                        scheduled_time: trigger.next_fire_time().unwrap_or(now),
                        priority: trigger.priority,
                        state: FiredTriggerState::Acquired,
                        concurrent_execution_disallowed: job.concurrent_execution_disallowed,
                        requests_recovery: job.requests_recovery,
                    },
                )
                .await?;
            StructuredLogger::log_trigger_acquired(
                &key,
                &fire_instance_id,
                trigger.next_fire_time(),
            );
            acquired.push(trigger);
            if acquired.len() >= max_count {
                break;
            }
        }

        self.metrics.record_triggers_acquired(acquired.len());
        Ok(acquired)
    }

    async fn release_acquired_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        let updated = self
            .delegate
            .update_trigger_state_from(conn, &trigger.key, RowState::Waiting, RowState::Acquired)
            .await?;
        if let Some(id) = &trigger.fire_instance_id {
            self.delegate
                .delete_acquired_fired_trigger(conn, id, &trigger.key)
                .await?;
        }
        if updated > 0 {
            self.metrics.record_trigger_released();
        }
        Ok(())
    }

    async fn select_trigger_and_job(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
    ) -> SchedulerResult<Option<(Trigger, JobDetail)>> {
        let Some((trigger, _)) = self.delegate.select_trigger(conn, key).await? else {
            return Ok(None);
        };
        let job = self.delegate.select_job(conn, &trigger.job_key).await?;
        Ok(job.map(|job| (trigger, job)))
    }

    /// 获取时无法读出的触发器置为 ERROR，不影响其他触发器
    async fn mark_key_error(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        error: &SchedulerError,
    ) -> SchedulerResult<()> {
        warn!("触发器 {} 无法读取，置为 ERROR 状态: {}", key, error);
        self.delegate
            .update_trigger_state(conn, key, RowState::Error)
            .await?;
        self.signaler()
            .notify_scheduler_listeners_error(&format!("触发器 {key} 无法读取"), error);
        Ok(())
    }

    /// 触发时发现配置错误：触发器置为 ERROR，删除本次触发记录
    pub(super) async fn mark_trigger_error(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
        error: &SchedulerError,
    ) -> SchedulerResult<()> {
        warn!("触发器 {} 触发失败，置为 ERROR 状态: {}", trigger.key, error);
        self.delegate
            .update_trigger_state(conn, &trigger.key, RowState::Error)
            .await?;
        if let Some(id) = &trigger.fire_instance_id {
            self.delegate.delete_fired_trigger(conn, id).await?;
        }
        Ok(())
    }

    async fn trigger_fired(
        &self,
        conn: &mut SqliteConnection,
        acquired: &Trigger,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TriggerFiredResult> {
        let Some((mut trigger, state)) = self.delegate.select_trigger(conn, &acquired.key).await?
        else {
            return Ok(TriggerFiredResult::Skipped);
        };
        if state != RowState::Acquired {
            return Ok(TriggerFiredResult::Skipped);
        }

        let calendar = match &trigger.calendar_name {
            Some(name) => match self.delegate.select_calendar(conn, name).await? {
                Some(calendar) => Some(calendar),
                None => return Err(SchedulerError::CalendarNotFound(name.clone())),
            },
            None => None,
        };
        let Some(job) = self.delegate.select_job(conn, &trigger.job_key).await? else {
            return Ok(TriggerFiredResult::Skipped);
        };
        let fire_instance_id = acquired.fire_instance_id.clone().unwrap_or_default();

        if self.apply_misfire(conn, &mut trigger, now).await? {
            self.delegate
                .delete_fired_trigger(conn, &fire_instance_id)
                .await?;
            let new_state = if trigger.next_fire_time().is_some() {
                RowState::Waiting
            } else {
                RowState::Complete
            };
            self.delegate.upsert_trigger(conn, &trigger, new_state).await?;
            self.signaler().signal_scheduling_change(None);
            return Ok(TriggerFiredResult::Skipped);
        }

        self.delegate
            .update_fired_trigger(conn, &fire_instance_id, FiredTriggerState::Executing, now)
            .await?;

        let scheduled_fire_time = trigger.next_fire_time();
        let previous_fire_time = trigger.previous_fire_time();
        trigger.triggered(calendar.as_ref());
        trigger.fire_instance_id = Some(fire_instance_id.clone());

        let mut new_state = RowState::Waiting;
        if job.concurrent_execution_disallowed {
            new_state = RowState::Blocked;
            for (blocked, from) in [
                (RowState::Blocked, RowState::Waiting),
                (RowState::Blocked, RowState::Acquired),
                (RowState::PausedBlocked, RowState::Paused),
            ] {
                self.delegate
                    .update_job_trigger_states_from(conn, &job.key, blocked, from)
                    .await?;
            }
            if self
                .delegate
                .is_group_paused(conn, GroupKind::Trigger, trigger.key.group())
                .await?
            {
                new_state = RowState::PausedBlocked;
            }
        }
        if trigger.next_fire_time().is_none() {
            new_state = RowState::Complete;
        }
        self.delegate.upsert_trigger(conn, &trigger, new_state).await?;

        StructuredLogger::log_trigger_fired(
            &trigger.key,
            &job.key,
            &fire_instance_id,
            scheduled_fire_time,
            trigger.next_fire_time(),
        );
        self.metrics.record_trigger_fired();

        Ok(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
            recovering: trigger.is_recovering(),
            next_fire_time: trigger.next_fire_time(),
            job_detail: job,
            trigger,
            calendar,
            fire_time: now,
            scheduled_fire_time,
            previous_fire_time,
        })))
    }

    async fn triggered_job_complete(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()> {
        let signaler = self.signaler();
        match instruction {
            CompletedExecutionInstruction::DeleteTrigger => {
                if trigger.next_fire_time().is_none() {
                    // 执行期间被重新调度的触发器保留
                    let stored = self.delegate.select_trigger(conn, &trigger.key).await?;
                    if let Some((stored, _)) = stored {
                        if stored.next_fire_time().is_none() {
                            self.remove_trigger(conn, &trigger.key, true).await?;
                        }
                    }
                } else {
                    self.remove_trigger(conn, &trigger.key, true).await?;
                    signaler.signal_scheduling_change(None);
                }
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.delegate
                    .update_trigger_state(conn, &trigger.key, RowState::Complete)
                    .await?;
                signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                info!("触发器 {} 被置为 ERROR 状态", trigger.key);
                self.delegate
                    .update_trigger_state(conn, &trigger.key, RowState::Error)
                    .await?;
                signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                self.delegate
                    .update_job_trigger_states(conn, &job.key, RowState::Complete)
                    .await?;
                signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                info!("作业 {} 的全部触发器被置为 ERROR 状态", job.key);
                self.delegate
                    .update_job_trigger_states(conn, &job.key, RowState::Error)
                    .await?;
                signaler.signal_scheduling_change(None);
            }
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {}
        }

        if job.concurrent_execution_disallowed {
            self.unblock_job_triggers(conn, &job.key).await?;
            signaler.signal_scheduling_change(None);
        }

        if job.persist_data_after_execution {
            if let Some(stored) = self.delegate.select_job(conn, &job.key).await? {
                if stored.data_map != job.data_map {
                    self.delegate
                        .update_job_data(conn, &job.key, &job.data_map)
                        .await?;
                }
            }
        }

        if let Some(id) = &trigger.fire_instance_id {
            self.delegate.delete_fired_trigger(conn, id).await?;
        }
        Ok(())
    }

    pub(super) async fn unblock_job_triggers(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
    ) -> SchedulerResult<()> {
        self.delegate
            .update_job_trigger_states_from(conn, job_key, RowState::Waiting, RowState::Blocked)
            .await?;
        self.delegate
            .update_job_trigger_states_from(conn, job_key, RowState::Paused, RowState::PausedBlocked)
            .await?;
        Ok(())
    }

    // ---- 暂停与恢复 ----

    async fn pause_trigger(&self, conn: &mut SqliteConnection, key: &TriggerKey) -> SchedulerResult<()> {
        let paused = match self.delegate.select_trigger_state(conn, key).await? {
            Some(RowState::Waiting) | Some(RowState::Acquired) => RowState::Paused,
            Some(RowState::Blocked) => RowState::PausedBlocked,
            _ => return Ok(()),
        };
        self.delegate.update_trigger_state(conn, key, paused).await?;
        Ok(())
    }

    async fn pause_triggers(
        &self,
        conn: &mut SqliteConnection,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<Vec<String>> {
        let groups: Vec<String> = match matcher.exact_value() {
            Some(group) => vec![group.to_string()],
            None => self
                .trigger_group_names(conn)
                .await?
                .into_iter()
                .filter(|group| matcher.is_match(group))
                .collect(),
        };

        let mut paused_groups = Vec::new();
        for group in groups {
            for (paused, from) in [
                (RowState::Paused, RowState::Waiting),
                (RowState::Paused, RowState::Acquired),
                (RowState::PausedBlocked, RowState::Blocked),
            ] {
                self.delegate
                    .update_group_trigger_states_from(conn, &group, paused, from)
                    .await?;
            }
            if self
                .delegate
                .insert_paused_group(conn, GroupKind::Trigger, &group)
                .await?
            {
                paused_groups.push(group);
            }
        }
        Ok(paused_groups)
    }

    async fn pause_job(&self, conn: &mut SqliteConnection, key: &JobKey) -> SchedulerResult<()> {
        for (trigger, _) in self.delegate.select_triggers_for_job(conn, key).await? {
            self.pause_trigger(conn, &trigger.key).await?;
        }
        Ok(())
    }

    async fn pause_jobs(
        &self,
        conn: &mut SqliteConnection,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<Vec<String>> {
        let groups: Vec<String> = match matcher.exact_value() {
            Some(group) => vec![group.to_string()],
            None => self
                .job_group_names(conn)
                .await?
                .into_iter()
                .filter(|group| matcher.is_match(group))
                .collect(),
        };

        let mut paused_groups = Vec::new();
        for group in groups {
            if self
                .delegate
                .insert_paused_group(conn, GroupKind::Job, &group)
                .await?
            {
                paused_groups.push(group.clone());
            }
            let group_matcher = GroupMatcher::equals(group.as_str());
            for job_key in self.job_keys(conn, &group_matcher).await? {
                self.pause_job(conn, &job_key).await?;
            }
        }
        Ok(paused_groups)
    }

    async fn resume_trigger(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        let Some((mut trigger, state)) = self.delegate.select_trigger(conn, key).await? else {
            return Ok(());
        };
        if !matches!(state, RowState::Paused | RowState::PausedBlocked) {
            return Ok(());
        }

        let blocked = match self.delegate.select_job(conn, &trigger.job_key).await? {
            Some(job) if job.concurrent_execution_disallowed => {
                self.delegate.job_is_executing(conn, &job.key).await?
            }
            _ => false,
        };
        let resumed = if blocked {
            RowState::Blocked
        } else {
            RowState::Waiting
        };

        if self.apply_misfire(conn, &mut trigger, now).await? {
            let new_state = if trigger.next_fire_time().is_some() {
                resumed
            } else {
                RowState::Complete
            };
            self.delegate.upsert_trigger(conn, &trigger, new_state).await?;
        } else {
            self.delegate.update_trigger_state(conn, key, resumed).await?;
        }
        Ok(())
    }

    async fn resume_triggers(
        &self,
        conn: &mut SqliteConnection,
        matcher: &GroupMatcher,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<String>> {
        let paused_job_groups = self
            .delegate
            .select_paused_groups(conn, GroupKind::Job)
            .await?;
        let mut groups = BTreeSet::new();

        for key in self.trigger_keys(conn, matcher).await? {
            let Some((trigger, _)) = self.delegate.select_trigger(conn, &key).await? else {
                continue;
            };
            if paused_job_groups.contains(trigger.job_key.group()) {
                continue;
            }
            groups.insert(key.group().to_string());
            self.resume_trigger(conn, &key, now).await?;
        }

        for group in self
            .delegate
            .select_paused_groups(conn, GroupKind::Trigger)
            .await?
        {
            if matcher.is_match(&group) {
                self.delegate
                    .delete_paused_group(conn, GroupKind::Trigger, &group)
                    .await?;
                groups.insert(group);
            }
        }
        Ok(groups.into_iter().collect())
    }

    async fn resume_job(
        &self,
        conn: &mut SqliteConnection,
        key: &JobKey,
        now: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        for (trigger, _) in self.delegate.select_triggers_for_job(conn, key).await? {
            self.resume_trigger(conn, &trigger.key, now).await?;
        }
        Ok(())
    }

    async fn resume_jobs(
        &self,
        conn: &mut SqliteConnection,
        matcher: &GroupMatcher,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<String>> {
        let mut groups = BTreeSet::new();
        for job_key in self.job_keys(conn, matcher).await? {
            groups.insert(job_key.group().to_string());
            self.resume_job(conn, &job_key, now).await?;
        }
        for group in self.delegate.select_paused_groups(conn, GroupKind::Job).await? {
            if matcher.is_match(&group) {
                self.delegate
                    .delete_paused_group(conn, GroupKind::Job, &group)
                    .await?;
                groups.insert(group);
            }
        }
        Ok(groups.into_iter().collect())
    }

    // ---- 枚举 ----

    async fn job_keys(
        &self,
        conn: &mut SqliteConnection,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<BTreeSet<JobKey>> {
        Ok(self
            .delegate
            .select_job_keys(conn)
            .await?
            .into_iter()
            .filter(|key| matcher.is_match(key.group()))
            .collect())
    }

    async fn trigger_keys(
        &self,
        conn: &mut SqliteConnection,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<BTreeSet<TriggerKey>> {
        Ok(self
            .delegate
            .select_trigger_keys(conn)
            .await?
            .into_iter()
            .filter(|key| matcher.is_match(key.group()))
            .collect())
    }

    async fn job_group_names(&self, conn: &mut SqliteConnection) -> SchedulerResult<Vec<String>> {
        let groups: BTreeSet<String> = self
            .delegate
            .select_job_keys(conn)
            .await?
            .iter()
            .map(|key| key.group().to_string())
            .collect();
        Ok(groups.into_iter().collect())
    }

    async fn trigger_group_names(&self, conn: &mut SqliteConnection) -> SchedulerResult<Vec<String>> {
        let groups: BTreeSet<String> = self
            .delegate
            .select_trigger_keys(conn)
            .await?
            .iter()
            .map(|key| key.group().to_string())
            .collect();
        Ok(groups.into_iter().collect())
    }

    // ---- 恢复 ----

    /// 处理一组遗留的触发记录：已获取的放回等待，正在执行且请求恢复的生成恢复触发器
    pub(super) async fn recover_fired_records(
        &self,
        conn: &mut SqliteConnection,
        records: &[FiredTriggerRecord],
    ) -> SchedulerResult<usize> {
        let mut recovered = 0;
        for record in records {
            match record.state {
                FiredTriggerState::Acquired => {
                    self.delegate
                        .update_trigger_state_from(
                            conn,
                            &record.trigger_key,
                            RowState::Waiting,
                            RowState::Acquired,
                        )
                        .await?;
                }
                FiredTriggerState::Executing => {
                    if record.requests_recovery
                        && self.delegate.job_exists(conn, &record.job_key).await?
                    {
                        let original_data = self
                            .delegate
                            .select_trigger(conn, &record.trigger_key)
                            .await?
                            .map(|(trigger, _)| trigger.data_map);
                        let sequence = self.recovery_sequence.fetch_add(1, Ordering::SeqCst);
                        let trigger = recovery_trigger(record, original_data.as_ref(), sequence);
                        self.store_trigger(conn, &trigger, false, true).await?;
                        recovered += 1;
                    }
                }
            }
            if record.concurrent_execution_disallowed {
                self.unblock_job_triggers(conn, &record.job_key).await?;
            }
        }
        Ok(recovered)
    }

    /// 非集群模式启动时的恢复
    async fn recover_jobs(&self, conn: &mut SqliteConnection) -> SchedulerResult<usize> {
        let now = Utc::now();
        for (to, from) in [
            (RowState::Waiting, RowState::Acquired),
            (RowState::Waiting, RowState::Blocked),
            (RowState::Paused, RowState::PausedBlocked),
        ] {
            self.delegate
                .update_all_trigger_states_from(conn, to, from)
                .await?;
        }

        while self.recover_misfired(conn, now).await? >= MAX_MISFIRES_PER_PASS {}

        let records = self
            .delegate
            .select_instance_fired_records(conn, &self.instance_id)
            .await?;
        let recovered = self.recover_fired_records(conn, &records).await?;
        self.delegate
            .delete_instance_fired_records(conn, &self.instance_id)
            .await?;

        for key in self
            .delegate
            .select_trigger_keys_in_state(conn, RowState::Complete)
            .await?
        {
            self.remove_trigger(conn, &key, true).await?;
        }

        self.metrics.record_recovered_jobs(recovered);
        Ok(recovered)
    }
}

/// SQLite 持久化作业存储
///
/// 每个写操作在一个事务中完成，事务开始后先取得 `TRIGGER_ACCESS` 锁。
/// 集群模式下额外启动签到任务，检测失效实例并接管其遗留的触发。
pub struct SqliteJobStore {
    core: Arc<StoreCore>,
    checkin_task: StdMutex<Option<JoinHandle<()>>>,
}

impl SqliteJobStore {
    /// 创建嵌入式SQLite作业存储，自动初始化数据库
    pub async fn new_embedded(
        config: &JobStoreSection,
        sched_name: &str,
        instance_id: &str,
    ) -> SchedulerResult<Self> {
        debug!(
            "Creating embedded SQLite job store at: {}",
            config.database_url
        );

        let connect_options = SqliteConnectOptions::from_str(&config.database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        Self::with_pool(pool, config, sched_name, instance_id).await
    }

    /// 使用已有连接池创建存储，会运行迁移
    pub async fn with_pool(
        pool: SqlitePool,
        config: &JobStoreSection,
        sched_name: &str,
        instance_id: &str,
    ) -> SchedulerResult<Self> {
        run_migrations(&pool).await?;

        let now_ms = Utc::now().timestamp_millis();
        let core = StoreCore {
            pool,
            delegate: SqliteDelegate::new(sched_name),
            semaphore: semaphore_from_config(config, sched_name),
            instance_id: instance_id.to_string(),
            misfire_threshold: config.misfire_threshold(),
            clustered: config.is_clustered,
            checkin_interval: config.cluster_checkin_interval(),
            acquire_triggers_within_lock: config.acquire_triggers_within_lock,
            last_checkin_ms: AtomicI64::new(now_ms),
            signaler: OnceLock::new(),
            fire_sequence: AtomicU64::new(now_ms.max(0) as u64),
            recovery_sequence: AtomicU64::new(now_ms.max(0) as u64),
            metrics: MetricsCollector::new(),
        };

        debug!("Successfully created SQLite job store for scheduler {}", sched_name);
        Ok(Self {
            core: Arc::new(core),
            checkin_task: StdMutex::new(None),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.core.pool
    }

    fn set_checkin_task(&self, handle: Option<JoinHandle<()>>) {
        let mut slot = match self.checkin_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = slot.take() {
            previous.abort();
        }
        *slot = handle;
    }

    /// 在单独的加锁事务中处理错过触发，避免未加锁的获取路径留下错过的触发器
    async fn handle_misfires(&self) -> SchedulerResult<()> {
        let now = Utc::now();
        let mut pooled = self.core.pool.acquire().await?;
        let pending = self
            .core
            .delegate
            .select_misfired_triggers(&mut pooled, self.core.misfire_time(now), 1)
            .await?;
        drop(pooled);
        if pending.is_empty() {
            return Ok(());
        }
        locked!(self, conn => self.core.recover_misfired(conn, now)).map(|_| ())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> SchedulerResult<()> {
        if self.core.signaler.set(signaler).is_err() {
            warn!("SQLite作业存储重复初始化，忽略新的回调接口");
        }
        info!(
            "SQLite作业存储初始化完成，调度器: {}，实例: {}，集群: {}",
            self.core.delegate.sched_name(),
            self.core.instance_id,
            self.core.clustered
        );
        Ok(())
    }

    async fn scheduler_started(&self) -> SchedulerResult<()> {
        if self.core.clustered {
            self.core.cluster_check_in(true).await?;
            let core = self.core.clone();
            let handle = tokio::spawn(async move {
                core.run_checkin_loop().await;
            });
            self.set_checkin_task(Some(handle));
        } else {
            let recovered = locked!(self, conn => self.core.recover_jobs(conn))?;
            if recovered > 0 {
                info!("启动恢复完成，创建了 {} 个恢复触发器", recovered);
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> SchedulerResult<()> {
        self.set_checkin_task(None);
        self.core.pool.close().await;
        debug!("SQLite作业存储已关闭");
        Ok(())
    }

    fn supports_persistence(&self) -> bool {
        true
    }

    fn is_clustered(&self) -> bool {
        self.core.clustered
    }

    fn estimated_time_to_release_and_acquire_trigger(&self) -> Duration {
        Duration::milliseconds(70)
    }

    async fn store_job_and_trigger(
        &self,
        job: &JobDetail,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        locked!(self, conn => async move {
            self.core.store_job(conn, job, false).await?;
            self.core.store_trigger(conn, trigger, false, false).await
        })
    }

    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> SchedulerResult<()> {
        locked!(self, conn => self.core.store_job(conn, job, replace_existing))
    }

    async fn store_jobs_and_triggers(
        &self,
        jobs: &[(JobDetail, Vec<Trigger>)],
        replace: bool,
    ) -> SchedulerResult<()> {
        locked!(self, conn => async move {
            for (job, triggers) in jobs {
                self.core.store_job(conn, job, replace).await?;
                for trigger in triggers {
                    self.core.store_trigger(conn, trigger, replace, false).await?;
                }
            }
            Ok(())
        })
    }

    async fn remove_job(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        locked!(self, conn => self.core.remove_job(conn, job_key))
    }

    async fn retrieve_job(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        read!(self, conn => self.core.delegate.select_job(conn, job_key))
    }

    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> SchedulerResult<()> {
        locked!(self, conn => self.core.store_trigger(conn, trigger, replace_existing, false))
    }

    async fn remove_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        locked!(self, conn => self.core.remove_trigger(conn, trigger_key, true))
    }

    async fn replace_trigger(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool> {
        locked!(self, conn => self.core.replace_trigger(conn, trigger_key, new_trigger))
    }

    async fn retrieve_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        let found = read!(self, conn => self.core.delegate.select_trigger(conn, trigger_key))?;
        Ok(found.map(|(trigger, _)| trigger))
    }

    async fn get_trigger_state(&self, trigger_key: &TriggerKey) -> SchedulerResult<TriggerState> {
        let state = read!(self, conn => self.core.delegate.select_trigger_state(conn, trigger_key))?;
        Ok(state.map(RowState::external).unwrap_or(TriggerState::None))
    }

    async fn reset_trigger_from_error_state(
        &self,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<()> {
        locked!(self, conn => async move {
            let paused = self
                .core
                .delegate
                .is_group_paused(conn, GroupKind::Trigger, trigger_key.group())
                .await?;
            let target = if paused { RowState::Paused } else { RowState::Waiting };
            self.core
                .delegate
                .update_trigger_state_from(conn, trigger_key, target, RowState::Error)
                .await
                .map(|_| ())
        })
    }

    async fn get_triggers_for_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        let triggers = read!(self, conn => self.core.delegate.select_triggers_for_job(conn, job_key))?;
        Ok(triggers.into_iter().map(|(trigger, _)| trigger).collect())
    }

    async fn clear_all_scheduling_data(&self) -> SchedulerResult<()> {
        locked!(self, conn => self.core.delegate.clear_data(conn))?;
        info!("SQLite作业存储已清空");
        Ok(())
    }

    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()> {
        locked!(self, conn => async move {
            if !replace_existing && self.core.delegate.calendar_exists(conn, name).await? {
                return Err(SchedulerError::ObjectAlreadyExists(format!(
                    "日历 {} 已存在",
                    name
                )));
            }
            self.core.delegate.upsert_calendar(conn, name, calendar).await?;

            if update_triggers {
                let now = Utc::now();
                for (mut trigger, _) in self
                    .core
                    .delegate
                    .select_triggers_for_calendar(conn, name)
                    .await?
                {
                    trigger.update_with_new_calendar(
                        Some(calendar),
                        self.core.misfire_threshold,
                        now,
                    );
                    self.core
                        .delegate
                        .update_trigger_schedule(conn, &trigger)
                        .await?;
                }
            }
            Ok(())
        })
    }

    async fn remove_calendar(&self, name: &str) -> SchedulerResult<bool> {
        locked!(self, conn => async move {
            if self.core.delegate.calendar_is_referenced(conn, name).await? {
                return Err(SchedulerError::JobPersistence(format!(
                    "日历 {} 仍被触发器引用，无法删除",
                    name
                )));
            }
            self.core.delegate.delete_calendar(conn, name).await
        })
    }

    async fn retrieve_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        read!(self, conn => self.core.delegate.select_calendar(conn, name))
    }

    async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>> {
        read!(self, conn => self.core.delegate.select_calendar_names(conn))
    }

    async fn get_number_of_jobs(&self) -> SchedulerResult<usize> {
        read!(self, conn => self.core.delegate.count_jobs(conn))
    }

    async fn get_number_of_triggers(&self) -> SchedulerResult<usize> {
        read!(self, conn => self.core.delegate.count_triggers(conn))
    }

    async fn get_number_of_calendars(&self) -> SchedulerResult<usize> {
        let names = read!(self, conn => self.core.delegate.select_calendar_names(conn))?;
        Ok(names.len())
    }

    async fn get_job_keys(&self, matcher: &GroupMatcher) -> SchedulerResult<BTreeSet<JobKey>> {
        read!(self, conn => self.core.job_keys(conn, matcher))
    }

    async fn get_trigger_keys(
        &self,
        matcher: &GroupMatcher,
    ) -> SchedulerResult<BTreeSet<TriggerKey>> {
        read!(self, conn => self.core.trigger_keys(conn, matcher))
    }

    async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>> {
        read!(self, conn => self.core.job_group_names(conn))
    }

    async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>> {
        read!(self, conn => self.core.trigger_group_names(conn))
    }

    async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        locked!(self, conn => self.core.pause_trigger(conn, trigger_key))
    }

    async fn pause_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        locked!(self, conn => self.core.pause_triggers(conn, matcher))
    }

    async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        locked!(self, conn => self.core.pause_job(conn, job_key))
    }

    async fn pause_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        locked!(self, conn => self.core.pause_jobs(conn, matcher))
    }

    async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        locked!(self, conn => self.core.resume_trigger(conn, trigger_key, Utc::now()))
    }

    async fn resume_triggers(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        locked!(self, conn => self.core.resume_triggers(conn, matcher, Utc::now()))
    }

    async fn get_paused_trigger_groups(&self) -> SchedulerResult<BTreeSet<String>> {
        read!(self, conn => self.core.delegate.select_paused_groups(conn, GroupKind::Trigger))
    }

    async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        locked!(self, conn => self.core.resume_job(conn, job_key, Utc::now()))
    }

    async fn resume_jobs(&self, matcher: &GroupMatcher) -> SchedulerResult<Vec<String>> {
        locked!(self, conn => self.core.resume_jobs(conn, matcher, Utc::now()))
    }

    async fn pause_all(&self) -> SchedulerResult<()> {
        locked!(self, conn => async move {
            for group in self.core.trigger_group_names(conn).await? {
                self.core
                    .pause_triggers(conn, &GroupMatcher::equals(group))
                    .await?;
            }
            Ok(())
        })
    }

    async fn resume_all(&self) -> SchedulerResult<()> {
        locked!(self, conn => async move {
            self.core
                .delegate
                .delete_paused_groups(conn, GroupKind::Job)
                .await?;
            self.core
                .resume_triggers(conn, &GroupMatcher::any(), Utc::now())
                .await
                .map(|_| ())
        })
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        let started = Instant::now();
        self.handle_misfires().await?;

        let max_count = max_count.max(1);
        let lock_name = if self.core.acquire_triggers_within_lock || max_count > 1 {
            Some(LOCK_TRIGGER_ACCESS)
        } else {
            None
        };
        let (mut tx, _lock) = self.core.begin(lock_name).await?;
        let result = self
            .core
            .acquire_next_triggers(&mut tx, no_later_than, max_count, time_window)
            .await;
        let acquired = finish(tx, result).await?;
        self.core
            .metrics
            .record_store_operation(started.elapsed().as_secs_f64());
        Ok(acquired)
    }

    async fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()> {
        locked!(self, conn => self.core.release_acquired_trigger(conn, trigger))
    }

    async fn triggers_fired(&self, triggers: &[Trigger]) -> SchedulerResult<Vec<TriggerFiredResult>> {
        let started = Instant::now();
        let results = locked!(self, conn => async move {
            let now = Utc::now();
            let mut results = Vec::with_capacity(triggers.len());
            for trigger in triggers {
                let result = match self.core.trigger_fired(conn, trigger, now).await {
                    Ok(result) => result,
                    Err(SchedulerError::Database(e)) => return Err(SchedulerError::Database(e)),
                    Err(e) => {
                        self.core.mark_trigger_error(conn, trigger, &e).await?;
                        TriggerFiredResult::Failed(e)
                    }
                };
                results.push(result);
            }
            Ok(results)
        })?;
        self.core
            .metrics
            .record_store_operation(started.elapsed().as_secs_f64());
        Ok(results)
    }

    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<()> {
        locked!(self, conn => self.core.triggered_job_complete(conn, trigger, job, instruction))
    }

    async fn get_fired_trigger_records(&self) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        read!(self, conn => self.core.delegate.select_fired_records(conn))
    }
}
