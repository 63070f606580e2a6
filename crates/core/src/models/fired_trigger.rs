use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::models::{JobDetail, JobKey, Trigger, TriggerKey};
use crate::SchedulerError;

/// 恢复触发器数据中记录原触发器名称的键
pub const FAILED_JOB_ORIGINAL_TRIGGER_NAME: &str = "SCHED_FAILED_JOB_ORIG_TRIGGER_NAME";
/// 恢复触发器数据中记录原触发器分组的键
pub const FAILED_JOB_ORIGINAL_TRIGGER_GROUP: &str = "SCHED_FAILED_JOB_ORIG_TRIGGER_GROUP";
/// 原触发时间（毫秒时间戳）
pub const FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME: &str = "SCHED_FAILED_JOB_ORIG_TRIGGER_FIRETIME";
/// 原计划触发时间（毫秒时间戳）
pub const FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME: &str =
    "SCHED_FAILED_JOB_ORIG_TRIGGER_SCHEDULED_FIRETIME";

/// 触发记录状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiredTriggerState {
    Acquired,
    Executing,
}

impl FiredTriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredTriggerState::Acquired => "ACQUIRED",
            FiredTriggerState::Executing => "EXECUTING",
        }
    }
}

impl fmt::Display for FiredTriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FiredTriggerState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACQUIRED" => Ok(FiredTriggerState::Acquired),
            "EXECUTING" => Ok(FiredTriggerState::Executing),
            other => Err(SchedulerError::Serialization(format!(
                "未知的触发记录状态: {}",
                other
            ))),
        }
    }
}

/// 正在处理中的一次触发，用于崩溃后的恢复
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    /// 持有该触发的调度器实例
    pub instance_id: String,
    pub fired_time: DateTime<Utc>,
    pub scheduled_time: DateTime<Utc>,
    pub priority: i32,
    pub state: FiredTriggerState,
    pub concurrent_execution_disallowed: bool,
    pub requests_recovery: bool,
}

/// 触发成功后交给执行器的快照
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job_detail: JobDetail,
    pub trigger: Trigger,
    pub calendar: Option<Calendar>,
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
}

/// `triggers_fired` 对单个触发器的处理结果
#[derive(Debug)]
pub enum TriggerFiredResult {
    Fired(Box<TriggerFiredBundle>),
    /// 触发器已被删除/不再处于获取状态，或错过触发后被重新排期
    Skipped,
    Failed(SchedulerError),
}

impl TriggerFiredResult {
    pub fn into_bundle(self) -> Option<TriggerFiredBundle> {
        match self {
            TriggerFiredResult::Fired(bundle) => Some(*bundle),
            _ => None,
        }
    }
}
