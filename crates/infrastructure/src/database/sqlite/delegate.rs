//! SQL 语句
//!
//! 所有语句都在调用方给出的连接上执行，事务和加锁由调用方负责。

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use scheduler_core::{
    Calendar, FiredTriggerRecord, FiredTriggerState, JobDataMap, JobDetail, JobKey,
    SchedulerResult, Trigger, TriggerKey,
};
use sqlx::{Row, SqliteConnection};

use super::mapping::{
    data_map_to_json, from_millis, row_to_calendar, row_to_fired_record, row_to_job,
    row_to_trigger, to_millis, RowState,
};

/// 暂停分组的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Trigger,
    Job,
}

impl GroupKind {
    fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Trigger => "TRIGGER",
            GroupKind::Job => "JOB",
        }
    }
}

/// 集群中一个实例的签到记录
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

const TRIGGER_COLUMNS: &str = "trigger_name, trigger_group, job_name, job_group, description, \
     next_fire_time, prev_fire_time, priority, trigger_state, schedule_kind, schedule_data, \
     start_time, end_time, calendar_name, misfire_instr, job_data";

const JOB_COLUMNS: &str = "job_name, job_group, description, job_type, is_durable, \
     is_nonconcurrent, is_update_data, requests_recovery, job_data";

const FIRED_COLUMNS: &str = "entry_id, trigger_name, trigger_group, job_name, job_group, \
     instance_name, fired_time, sched_time, priority, state, is_nonconcurrent, requests_recovery";

#[derive(Debug, Clone)]
pub struct SqliteDelegate {
    sched_name: String,
}

impl SqliteDelegate {
    pub fn new(sched_name: impl Into<String>) -> Self {
        Self {
            sched_name: sched_name.into(),
        }
    }

    pub fn sched_name(&self) -> &str {
        &self.sched_name
    }

    // ---- 作业 ----

    pub async fn job_exists(&self, conn: &mut SqliteConnection, key: &JobKey) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_details WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    /// 插入作业，存在时整体覆盖
    pub async fn upsert_job(&self, conn: &mut SqliteConnection, job: &JobDetail) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job_details (sched_name, job_name, job_group, description, job_type,
                is_durable, is_nonconcurrent, is_update_data, requests_recovery, job_data)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (sched_name, job_name, job_group) DO UPDATE SET
                description = excluded.description,
                job_type = excluded.job_type,
                is_durable = excluded.is_durable,
                is_nonconcurrent = excluded.is_nonconcurrent,
                is_update_data = excluded.is_update_data,
                requests_recovery = excluded.requests_recovery,
                job_data = excluded.job_data
            "#,
        )
        .bind(&self.sched_name)
        .bind(job.key.name())
        .bind(job.key.group())
        .bind(&job.description)
        .bind(&job.job_type)
        .bind(job.durable)
        .bind(job.concurrent_execution_disallowed)
        .bind(job.persist_data_after_execution)
        .bind(job.requests_recovery)
        .bind(data_map_to_json(&job.data_map)?)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn select_job(
        &self,
        conn: &mut SqliteConnection,
        key: &JobKey,
    ) -> SchedulerResult<Option<JobDetail>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_details WHERE sched_name = ? AND job_name = ? AND job_group = ?"
        );
        let row = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(key.name())
            .bind(key.group())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    pub async fn delete_job(&self, conn: &mut SqliteConnection, key: &JobKey) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM job_details WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_job_data(
        &self,
        conn: &mut SqliteConnection,
        key: &JobKey,
        data: &JobDataMap,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "UPDATE job_details SET job_data = ? WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(data_map_to_json(data)?)
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn select_job_keys(&self, conn: &mut SqliteConnection) -> SchedulerResult<Vec<JobKey>> {
        let rows = sqlx::query(
            "SELECT job_name, job_group FROM job_details WHERE sched_name = ? ORDER BY job_group, job_name",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(JobKey::new(
                    row.try_get::<String, _>("job_name")?,
                    row.try_get::<String, _>("job_group")?,
                ))
            })
            .collect()
    }

    pub async fn count_jobs(&self, conn: &mut SqliteConnection) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM job_details WHERE sched_name = ?")
            .bind(&self.sched_name)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.max(0) as usize)
    }

    // ---- 触发器 ----

    pub async fn trigger_exists(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
    ) -> SchedulerResult<bool> {
        Ok(self.select_trigger_state(conn, key).await?.is_some())
    }

    /// 插入触发器，存在时整体覆盖
    pub async fn upsert_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
        state: RowState,
    ) -> SchedulerResult<()> {
        let sql = format!(
            r#"
            INSERT INTO triggers (sched_name, {TRIGGER_COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (sched_name, trigger_name, trigger_group) DO UPDATE SET
                job_name = excluded.job_name,
                job_group = excluded.job_group,
                description = excluded.description,
                next_fire_time = excluded.next_fire_time,
                prev_fire_time = excluded.prev_fire_time,
                priority = excluded.priority,
                trigger_state = excluded.trigger_state,
                schedule_kind = excluded.schedule_kind,
                schedule_data = excluded.schedule_data,
                start_time = excluded.start_time,
                end_time = excluded.end_time,
                calendar_name = excluded.calendar_name,
                misfire_instr = excluded.misfire_instr,
                job_data = excluded.job_data
            "#
        );
        sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(trigger.key.name())
            .bind(trigger.key.group())
            .bind(trigger.job_key.name())
            .bind(trigger.job_key.group())
            .bind(&trigger.description)
            .bind(trigger.next_fire_time().map(to_millis))
            .bind(trigger.previous_fire_time().map(to_millis))
            .bind(trigger.priority)
            .bind(state.as_str())
            .bind(trigger.schedule.kind())
            .bind(serde_json::to_string(&trigger.schedule)?)
            .bind(to_millis(trigger.start_time()))
            .bind(trigger.end_time().map(to_millis))
            .bind(&trigger.calendar_name)
            .bind(trigger.misfire_instruction.as_str())
            .bind(data_map_to_json(&trigger.data_map)?)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// 只更新调度相关的列，保持状态不变
    pub async fn update_trigger_schedule(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            UPDATE triggers SET next_fire_time = ?, prev_fire_time = ?, schedule_data = ?
            WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?
            "#,
        )
        .bind(trigger.next_fire_time().map(to_millis))
        .bind(trigger.previous_fire_time().map(to_millis))
        .bind(serde_json::to_string(&trigger.schedule)?)
        .bind(&self.sched_name)
        .bind(trigger.key.name())
        .bind(trigger.key.group())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn select_trigger(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
    ) -> SchedulerResult<Option<(Trigger, RowState)>> {
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?"
        );
        let row = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(key.name())
            .bind(key.group())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(row_to_trigger).transpose()
    }

    pub async fn select_trigger_state(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
    ) -> SchedulerResult<Option<RowState>> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT trigger_state FROM triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .fetch_optional(&mut *conn)
        .await?;
        state.map(|s| s.parse()).transpose()
    }

    pub async fn update_trigger_state(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        state: RowState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE triggers SET trigger_state = ? WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(state.as_str())
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// 仅当当前状态为 `old_state` 时更新，返回受影响行数
    pub async fn update_trigger_state_from(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
        new_state: RowState,
        old_state: RowState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET trigger_state = ?
            WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ? AND trigger_state = ?
            "#,
        )
        .bind(new_state.as_str())
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .bind(old_state.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_job_trigger_states(
        &self,
        conn: &mut SqliteConnection,
        job: &JobKey,
        new_state: RowState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE triggers SET trigger_state = ? WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(new_state.as_str())
        .bind(&self.sched_name)
        .bind(job.name())
        .bind(job.group())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_job_trigger_states_from(
        &self,
        conn: &mut SqliteConnection,
        job: &JobKey,
        new_state: RowState,
        old_state: RowState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET trigger_state = ?
            WHERE sched_name = ? AND job_name = ? AND job_group = ? AND trigger_state = ?
            "#,
        )
        .bind(new_state.as_str())
        .bind(&self.sched_name)
        .bind(job.name())
        .bind(job.group())
        .bind(old_state.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_group_trigger_states_from(
        &self,
        conn: &mut SqliteConnection,
        group: &str,
        new_state: RowState,
        old_state: RowState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE triggers SET trigger_state = ?
            WHERE sched_name = ? AND trigger_group = ? AND trigger_state = ?
            "#,
        )
        .bind(new_state.as_str())
        .bind(&self.sched_name)
        .bind(group)
        .bind(old_state.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_all_trigger_states_from(
        &self,
        conn: &mut SqliteConnection,
        new_state: RowState,
        old_state: RowState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE triggers SET trigger_state = ? WHERE sched_name = ? AND trigger_state = ?",
        )
        .bind(new_state.as_str())
        .bind(&self.sched_name)
        .bind(old_state.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_trigger(
        &self,
        conn: &mut SqliteConnection,
        key: &TriggerKey,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "DELETE FROM triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(key.name())
        .bind(key.group())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn select_triggers_for_job(
        &self,
        conn: &mut SqliteConnection,
        job: &JobKey,
    ) -> SchedulerResult<Vec<(Trigger, RowState)>> {
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers \
             WHERE sched_name = ? AND job_name = ? AND job_group = ? \
             ORDER BY trigger_group, trigger_name"
        );
        let rows = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(job.name())
            .bind(job.group())
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_trigger).collect()
    }

    pub async fn count_triggers_for_job(
        &self,
        conn: &mut SqliteConnection,
        job: &JobKey,
    ) -> SchedulerResult<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM triggers WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(job.name())
        .bind(job.group())
        .fetch_one(&mut *conn)
        .await?)
    }

    pub async fn select_trigger_keys(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<Vec<TriggerKey>> {
        let rows = sqlx::query(
            "SELECT trigger_name, trigger_group FROM triggers WHERE sched_name = ? ORDER BY trigger_group, trigger_name",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_trigger_key).collect()
    }

    pub async fn select_trigger_keys_in_state(
        &self,
        conn: &mut SqliteConnection,
        state: RowState,
    ) -> SchedulerResult<Vec<TriggerKey>> {
        let rows = sqlx::query(
            "SELECT trigger_name, trigger_group FROM triggers WHERE sched_name = ? AND trigger_state = ?",
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_trigger_key).collect()
    }

    pub async fn select_triggers_for_calendar(
        &self,
        conn: &mut SqliteConnection,
        calendar_name: &str,
    ) -> SchedulerResult<Vec<(Trigger, RowState)>> {
        let sql = format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE sched_name = ? AND calendar_name = ?"
        );
        let rows = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(calendar_name)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_trigger).collect()
    }

    pub async fn count_triggers(&self, conn: &mut SqliteConnection) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM triggers WHERE sched_name = ?")
            .bind(&self.sched_name)
            .fetch_one(&mut *conn)
            .await?;
        Ok(count.max(0) as usize)
    }

    /// 按 (下次触发时间, 优先级降序, 键) 选出可获取的触发器，已错过触发的除外
    pub async fn select_triggers_to_acquire(
        &self,
        conn: &mut SqliteConnection,
        no_later_than: DateTime<Utc>,
        misfire_time: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<TriggerKey>> {
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM triggers
            WHERE sched_name = ? AND trigger_state = ? AND next_fire_time <= ?
              AND (misfire_instr = 'IGNORE_MISFIRE_POLICY' OR next_fire_time >= ?)
            ORDER BY next_fire_time ASC, priority DESC, trigger_group ASC, trigger_name ASC
            LIMIT ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(RowState::Waiting.as_str())
        .bind(to_millis(no_later_than))
        .bind(to_millis(misfire_time))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_trigger_key).collect()
    }

    /// 等待中且下次触发时间早于 `misfire_time` 的触发器
    pub async fn select_misfired_triggers(
        &self,
        conn: &mut SqliteConnection,
        misfire_time: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<TriggerKey>> {
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM triggers
            WHERE sched_name = ? AND trigger_state = ? AND next_fire_time < ?
              AND misfire_instr <> 'IGNORE_MISFIRE_POLICY'
            ORDER BY next_fire_time ASC, priority DESC
            LIMIT ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(RowState::Waiting.as_str())
        .bind(to_millis(misfire_time))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(row_to_trigger_key).collect()
    }

    // ---- 日历 ----

    pub async fn calendar_exists(&self, conn: &mut SqliteConnection, name: &str) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calendars WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    pub async fn upsert_calendar(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        calendar: &Calendar,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO calendars (sched_name, calendar_name, calendar) VALUES (?, ?, ?)
            ON CONFLICT (sched_name, calendar_name) DO UPDATE SET calendar = excluded.calendar
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .bind(serde_json::to_string(calendar)?)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn select_calendar(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> SchedulerResult<Option<Calendar>> {
        let row = sqlx::query(
            "SELECT calendar FROM calendars WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(row_to_calendar).transpose()
    }

    pub async fn delete_calendar(&self, conn: &mut SqliteConnection, name: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM calendars WHERE sched_name = ? AND calendar_name = ?")
            .bind(&self.sched_name)
            .bind(name)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn calendar_is_referenced(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM triggers WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    pub async fn select_calendar_names(&self, conn: &mut SqliteConnection) -> SchedulerResult<Vec<String>> {
        Ok(sqlx::query_scalar(
            "SELECT calendar_name FROM calendars WHERE sched_name = ? ORDER BY calendar_name",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?)
    }

    // ---- 暂停分组 ----

    pub async fn is_group_paused(
        &self,
        conn: &mut SqliteConnection,
        kind: GroupKind,
        group: &str,
    ) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM paused_groups WHERE sched_name = ? AND group_kind = ? AND group_name = ?",
        )
        .bind(&self.sched_name)
        .bind(kind.as_str())
        .bind(group)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    /// 返回分组是否为新暂停的
    pub async fn insert_paused_group(
        &self,
        conn: &mut SqliteConnection,
        kind: GroupKind,
        group: &str,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO paused_groups (sched_name, group_kind, group_name) VALUES (?, ?, ?)",
        )
        .bind(&self.sched_name)
        .bind(kind.as_str())
        .bind(group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_paused_group(
        &self,
        conn: &mut SqliteConnection,
        kind: GroupKind,
        group: &str,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "DELETE FROM paused_groups WHERE sched_name = ? AND group_kind = ? AND group_name = ?",
        )
        .bind(&self.sched_name)
        .bind(kind.as_str())
        .bind(group)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_paused_groups(&self, conn: &mut SqliteConnection, kind: GroupKind) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM paused_groups WHERE sched_name = ? AND group_kind = ?")
            .bind(&self.sched_name)
            .bind(kind.as_str())
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn select_paused_groups(
        &self,
        conn: &mut SqliteConnection,
        kind: GroupKind,
    ) -> SchedulerResult<BTreeSet<String>> {
        let groups: Vec<String> = sqlx::query_scalar(
            "SELECT group_name FROM paused_groups WHERE sched_name = ? AND group_kind = ?",
        )
        .bind(&self.sched_name)
        .bind(kind.as_str())
        .fetch_all(&mut *conn)
        .await?;
        Ok(groups.into_iter().collect())
    }

    // ---- 触发记录 ----

    pub async fn insert_fired_trigger(
        &self,
        conn: &mut SqliteConnection,
        record: &FiredTriggerRecord,
    ) -> SchedulerResult<()> {
        let sql = format!(
            "INSERT INTO fired_triggers (sched_name, {FIRED_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(&record.fire_instance_id)
            .bind(record.trigger_key.name())
            .bind(record.trigger_key.group())
            .bind(record.job_key.name())
            .bind(record.job_key.group())
            .bind(&record.instance_id)
            .bind(to_millis(record.fired_time))
            .bind(to_millis(record.scheduled_time))
            .bind(record.priority)
            .bind(record.state.as_str())
            .bind(record.concurrent_execution_disallowed)
            .bind(record.requests_recovery)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn update_fired_trigger(
        &self,
        conn: &mut SqliteConnection,
        fire_instance_id: &str,
        state: FiredTriggerState,
        fired_time: DateTime<Utc>,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "UPDATE fired_triggers SET state = ?, fired_time = ? WHERE sched_name = ? AND entry_id = ?",
        )
        .bind(state.as_str())
        .bind(to_millis(fired_time))
        .bind(&self.sched_name)
        .bind(fire_instance_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_fired_trigger(
        &self,
        conn: &mut SqliteConnection,
        fire_instance_id: &str,
    ) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM fired_triggers WHERE sched_name = ? AND entry_id = ?")
            .bind(&self.sched_name)
            .bind(fire_instance_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// 只删除仍处于已获取状态的记录，已进入执行的记录保留
    pub async fn delete_acquired_fired_trigger(
        &self,
        conn: &mut SqliteConnection,
        fire_instance_id: &str,
        key: &TriggerKey,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM fired_triggers
            WHERE sched_name = ? AND entry_id = ? AND trigger_name = ? AND trigger_group = ? AND state = ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(fire_instance_id)
        .bind(key.name())
        .bind(key.group())
        .bind(FiredTriggerState::Acquired.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_fired_records(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let sql = format!(
            "SELECT {FIRED_COLUMNS} FROM fired_triggers WHERE sched_name = ? ORDER BY entry_id"
        );
        let rows = sqlx::query(&sql)
            .bind(&self.sched_name)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_fired_record).collect()
    }

    pub async fn select_instance_fired_records(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
    ) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let sql = format!(
            "SELECT {FIRED_COLUMNS} FROM fired_triggers WHERE sched_name = ? AND instance_name = ? ORDER BY entry_id"
        );
        let rows = sqlx::query(&sql)
            .bind(&self.sched_name)
            .bind(instance_id)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(row_to_fired_record).collect()
    }

    pub async fn delete_instance_fired_records(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
    ) -> SchedulerResult<u64> {
        let result =
            sqlx::query("DELETE FROM fired_triggers WHERE sched_name = ? AND instance_name = ?")
                .bind(&self.sched_name)
                .bind(instance_id)
                .execute(&mut *conn)
                .await?;
        Ok(result.rows_affected())
    }

    /// 留有触发记录的实例标识
    pub async fn select_fired_instance_names(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<BTreeSet<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT instance_name FROM fired_triggers WHERE sched_name = ?",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(names.into_iter().collect())
    }

    /// 作业是否有正在执行的触发
    pub async fn job_is_executing(&self, conn: &mut SqliteConnection, job: &JobKey) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM fired_triggers
            WHERE sched_name = ? AND job_name = ? AND job_group = ? AND state = ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(job.name())
        .bind(job.group())
        .bind(FiredTriggerState::Executing.as_str())
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    // ---- 集群签到 ----

    pub async fn update_scheduler_state(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
        checkin: DateTime<Utc>,
        checkin_interval_ms: i64,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_state SET last_checkin_time = ?, checkin_interval = ?
            WHERE sched_name = ? AND instance_name = ?
            "#,
        )
        .bind(to_millis(checkin))
        .bind(checkin_interval_ms)
        .bind(&self.sched_name)
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            sqlx::query(
                r#"
                INSERT INTO scheduler_state (sched_name, instance_name, last_checkin_time, checkin_interval)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&self.sched_name)
            .bind(instance_id)
            .bind(to_millis(checkin))
            .bind(checkin_interval_ms)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    pub async fn select_scheduler_states(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<Vec<SchedulerStateRecord>> {
        let rows = sqlx::query(
            "SELECT instance_name, last_checkin_time, checkin_interval FROM scheduler_state WHERE sched_name = ?",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(SchedulerStateRecord {
                    instance_id: row.try_get("instance_name")?,
                    last_checkin: from_millis(row.try_get("last_checkin_time")?)?,
                    checkin_interval_ms: row.try_get("checkin_interval")?,
                })
            })
            .collect()
    }

    pub async fn delete_scheduler_state(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
    ) -> SchedulerResult<()> {
        sqlx::query("DELETE FROM scheduler_state WHERE sched_name = ? AND instance_name = ?")
            .bind(&self.sched_name)
            .bind(instance_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// 删除本调度器的全部调度数据
    pub async fn clear_data(&self, conn: &mut SqliteConnection) -> SchedulerResult<()> {
        for table in [
            "fired_triggers",
            "triggers",
            "job_details",
            "calendars",
            "paused_groups",
        ] {
            let sql = format!("DELETE FROM {table} WHERE sched_name = ?");
            sqlx::query(&sql)
                .bind(&self.sched_name)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

fn row_to_trigger_key(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<TriggerKey> {
    Ok(TriggerKey::new(
        row.try_get::<String, _>("trigger_name")?,
        row.try_get::<String, _>("trigger_group")?,
    ))
}
