//! 行与模型之间的转换
//!
//! 时间列是 UTC 毫秒时间戳，数据映射、调度规则和日历以 JSON 文本保存。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use scheduler_core::{
    Calendar, FireTimes, FiredTriggerRecord, JobDataMap, JobDetail, JobKey, Schedule,
    SchedulerError, SchedulerResult, Trigger, TriggerKey, TriggerState,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// 触发器在表中的状态，比对外暴露的 [`TriggerState`] 更细
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Waiting,
    Acquired,
    Complete,
    Paused,
    Blocked,
    PausedBlocked,
    Error,
}

impl RowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowState::Waiting => "WAITING",
            RowState::Acquired => "ACQUIRED",
            RowState::Complete => "COMPLETE",
            RowState::Paused => "PAUSED",
            RowState::Blocked => "BLOCKED",
            RowState::PausedBlocked => "PAUSED_BLOCKED",
            RowState::Error => "ERROR",
        }
    }

    pub fn external(self) -> TriggerState {
        match self {
            RowState::Waiting | RowState::Acquired => TriggerState::Normal,
            RowState::Complete => TriggerState::Complete,
            RowState::Paused | RowState::PausedBlocked => TriggerState::Paused,
            RowState::Blocked => TriggerState::Blocked,
            RowState::Error => TriggerState::Error,
        }
    }
}

impl fmt::Display for RowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RowState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(RowState::Waiting),
            "ACQUIRED" => Ok(RowState::Acquired),
            "COMPLETE" => Ok(RowState::Complete),
            "PAUSED" => Ok(RowState::Paused),
            "BLOCKED" => Ok(RowState::Blocked),
            "PAUSED_BLOCKED" => Ok(RowState::PausedBlocked),
            "ERROR" => Ok(RowState::Error),
            other => Err(SchedulerError::Serialization(format!(
                "未知的触发器状态: {}",
                other
            ))),
        }
    }
}

pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub fn from_millis(millis: i64) -> SchedulerResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SchedulerError::Serialization(format!("无效的时间戳: {millis}")))
}

fn opt_from_millis(millis: Option<i64>) -> SchedulerResult<Option<DateTime<Utc>>> {
    millis.map(from_millis).transpose()
}

pub fn data_map_to_json(data: &JobDataMap) -> SchedulerResult<String> {
    Ok(serde_json::to_string(data)?)
}

fn parse_json<T: serde::de::DeserializeOwned>(row: &SqliteRow, field: &str) -> SchedulerResult<T> {
    let text: String = row.try_get(field)?;
    serde_json::from_str(&text)
        .map_err(|e| SchedulerError::Serialization(format!("解析字段 {field} 失败: {e}")))
}

pub fn row_to_job(row: &SqliteRow) -> SchedulerResult<JobDetail> {
    Ok(JobDetail {
        key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        description: row.try_get("description")?,
        job_type: row.try_get("job_type")?,
        data_map: parse_json(row, "job_data")?,
        durable: row.try_get("is_durable")?,
        requests_recovery: row.try_get("requests_recovery")?,
        concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
        persist_data_after_execution: row.try_get("is_update_data")?,
    })
}

pub fn row_to_trigger(row: &SqliteRow) -> SchedulerResult<(Trigger, RowState)> {
    let schedule: Schedule = parse_json(row, "schedule_data")?;
    let misfire: String = row.try_get("misfire_instr")?;
    let state: String = row.try_get("trigger_state")?;

    let trigger = Trigger {
        key: TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ),
        job_key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        description: row.try_get("description")?,
        calendar_name: row.try_get("calendar_name")?,
        data_map: parse_json(row, "job_data")?,
        priority: row.try_get("priority")?,
        misfire_instruction: misfire.parse()?,
        times: FireTimes {
            start_time: from_millis(row.try_get("start_time")?)?,
            end_time: opt_from_millis(row.try_get("end_time")?)?,
            next_fire_time: opt_from_millis(row.try_get("next_fire_time")?)?,
            previous_fire_time: opt_from_millis(row.try_get("prev_fire_time")?)?,
        },
        schedule,
        fire_instance_id: None,
    };
    Ok((trigger, state.parse()?))
}

pub fn row_to_fired_record(row: &SqliteRow) -> SchedulerResult<FiredTriggerRecord> {
    let state: String = row.try_get("state")?;
    Ok(FiredTriggerRecord {
        fire_instance_id: row.try_get("entry_id")?,
        trigger_key: TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ),
        job_key: JobKey::new(
            row.try_get::<String, _>("job_name")?,
            row.try_get::<String, _>("job_group")?,
        ),
        instance_id: row.try_get("instance_name")?,
        fired_time: from_millis(row.try_get("fired_time")?)?,
        scheduled_time: from_millis(row.try_get("sched_time")?)?,
        priority: row.try_get("priority")?,
        state: state.parse()?,
        concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
        requests_recovery: row.try_get("requests_recovery")?,
    })
}

pub fn row_to_calendar(row: &SqliteRow) -> SchedulerResult<Calendar> {
    parse_json(row, "calendar")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_state_text_round_trip() {
        for state in [
            RowState::Waiting,
            RowState::Acquired,
            RowState::Complete,
            RowState::Paused,
            RowState::Blocked,
            RowState::PausedBlocked,
            RowState::Error,
        ] {
            assert_eq!(state.as_str().parse::<RowState>().unwrap(), state);
        }
        assert!("DELETED".parse::<RowState>().is_err());
    }

    #[test]
    fn test_millis_conversion_keeps_precision() {
        let time = from_millis(1_900_000_000_123).unwrap();
        assert_eq!(to_millis(time), 1_900_000_000_123);
    }
}
