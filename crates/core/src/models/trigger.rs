use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::calendar::Calendar;
use crate::errors::{JobErrorDirective, JobExecutionError};
use crate::models::{JobDataMap, JobKey, TriggerKey, DEFAULT_GROUP};
use crate::schedule::{Schedule, SimpleSchedule};
use crate::{SchedulerError, SchedulerResult};

/// 默认触发优先级
pub const DEFAULT_PRIORITY: i32 = 5;

/// 恢复触发器所在的分组
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";

/// 超过该年份的触发时间视为永不触发
pub const YEAR_TO_GIVE_UP_SCHEDULING_AT: i32 = 2299;

/// 对外可见的触发器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    None,
    Normal,
    Paused,
    Complete,
    Error,
    Blocked,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = SchedulerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(SchedulerError::Serialization(format!(
                        "未知的{}取值: {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

/// 错过触发时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MisfireInstruction {
    /// 交给调度规则选择默认处理方式
    SmartPolicy,
    /// 从不视为错过触发，按原时间立即补发
    IgnoreMisfirePolicy,
    FireOnceNow,
    DoNothing,
    RescheduleNowWithExistingRepeatCount,
    RescheduleNowWithRemainingRepeatCount,
    RescheduleNextWithRemainingCount,
    RescheduleNextWithExistingCount,
}

string_enum!(MisfireInstruction {
    SmartPolicy => "SMART_POLICY",
    IgnoreMisfirePolicy => "IGNORE_MISFIRE_POLICY",
    FireOnceNow => "FIRE_ONCE_NOW",
    DoNothing => "DO_NOTHING",
    RescheduleNowWithExistingRepeatCount => "RESCHEDULE_NOW_WITH_EXISTING_REPEAT_COUNT",
    RescheduleNowWithRemainingRepeatCount => "RESCHEDULE_NOW_WITH_REMAINING_REPEAT_COUNT",
    RescheduleNextWithRemainingCount => "RESCHEDULE_NEXT_WITH_REMAINING_COUNT",
    RescheduleNextWithExistingCount => "RESCHEDULE_NEXT_WITH_EXISTING_COUNT",
});

/// 作业执行完成后对触发器的处理指令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletedExecutionInstruction {
    Noop,
    ReExecuteJob,
    SetTriggerComplete,
    DeleteTrigger,
    SetAllJobTriggersComplete,
    SetTriggerError,
    SetAllJobTriggersError,
}

string_enum!(CompletedExecutionInstruction {
    Noop => "NOOP",
    ReExecuteJob => "RE_EXECUTE_JOB",
    SetTriggerComplete => "SET_TRIGGER_COMPLETE",
    DeleteTrigger => "DELETE_TRIGGER",
    SetAllJobTriggersComplete => "SET_ALL_JOB_TRIGGERS_COMPLETE",
    SetTriggerError => "SET_TRIGGER_ERROR",
    SetAllJobTriggersError => "SET_ALL_JOB_TRIGGERS_ERROR",
});

/// 各调度规则共享的时间字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FireTimes {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
}

impl FireTimes {
    pub fn starting_at(start_time: DateTime<Utc>) -> Self {
        Self {
            start_time,
            end_time: None,
            next_fire_time: None,
            previous_fire_time: None,
        }
    }
}

/// 触发器：描述作业“何时执行”
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub calendar_name: Option<String>,
    pub data_map: JobDataMap,
    pub priority: i32,
    pub misfire_instruction: MisfireInstruction,
    pub times: FireTimes,
    pub schedule: Schedule,
    /// 被获取后由存储分配的本次触发实例标识
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    pub fn builder() -> TriggerBuilder {
        TriggerBuilder::new()
    }

    pub fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        self.times.next_fire_time
    }

    pub fn previous_fire_time(&self) -> Option<DateTime<Utc>> {
        self.times.previous_fire_time
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.times.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.times.end_time
    }

    pub fn set_next_fire_time(&mut self, next_fire_time: Option<DateTime<Utc>>) {
        self.times.next_fire_time = next_fire_time;
    }

    pub fn is_recovering(&self) -> bool {
        self.key.group() == RECOVERING_JOBS_GROUP
    }

    /// 计算首次触发时间（跳过日历排除的时间）并写回
    pub fn compute_first_fire_time(&mut self, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        let rule = self.schedule.rule();
        let first = rule.first_fire_time(&self.times);
        let next = skip_excluded(|t| rule.fire_time_after(&self.times, t), first, calendar);
        self.times.next_fire_time = next;
        next
    }

    /// 严格晚于 `after` 的下一次触发时间，不考虑日历
    pub fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.rule().fire_time_after(&self.times, after)
    }

    /// 触发一次后推进调度：previous = next，并计算之后的下一次
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        self.schedule.rule_mut().record_fired();
        self.times.previous_fire_time = self.times.next_fire_time;
        let rule = self.schedule.rule();
        let after = self
            .times
            .next_fire_time
            .and_then(|t| rule.fire_time_after(&self.times, t));
        self.times.next_fire_time =
            skip_excluded(|t| rule.fire_time_after(&self.times, t), after, calendar);
    }

    /// 按错过触发策略修正下一次触发时间
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        let instruction = self.misfire_instruction;
        self.schedule
            .rule_mut()
            .update_after_misfire(&mut self.times, instruction, calendar, now);
    }

    /// 日历变更后重新计算下一次触发时间
    ///
    /// 落在 `now - misfire_threshold` 之前的候选时间会被继续跳过。
    pub fn update_with_new_calendar(
        &mut self,
        calendar: Option<&Calendar>,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
    ) {
        let rule = self.schedule.rule();
        let after = self.times.previous_fire_time.unwrap_or(now);
        let mut next = rule.fire_time_after(&self.times, after);

        if let Some(calendar) = calendar {
            while let Some(candidate) = next {
                if calendar.is_time_included(candidate) {
                    break;
                }
                next = rule.fire_time_after(&self.times, candidate);
                let Some(following) = next else { break };
                if following.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                    next = None;
                    break;
                }
                if following < now && now - following >= misfire_threshold {
                    next = rule.fire_time_after(&self.times, following);
                }
            }
        }

        self.times.next_fire_time = next;
    }

    pub fn may_fire_again(&self) -> bool {
        self.times.next_fire_time.is_some()
    }

    pub fn final_fire_time(&self) -> Option<DateTime<Utc>> {
        self.schedule.rule().final_fire_time(&self.times)
    }

    /// 根据作业执行结果决定触发器的后续处理
    pub fn execution_complete(
        &self,
        result: Option<&JobExecutionError>,
    ) -> CompletedExecutionInstruction {
        if let Some(error) = result {
            match error.directive {
                JobErrorDirective::RefireImmediately => {
                    return CompletedExecutionInstruction::ReExecuteJob
                }
                JobErrorDirective::UnscheduleFiringTrigger => {
                    return CompletedExecutionInstruction::SetTriggerComplete
                }
                JobErrorDirective::UnscheduleAllTriggers => {
                    return CompletedExecutionInstruction::SetAllJobTriggersComplete
                }
                JobErrorDirective::MarkTriggerError => {
                    return CompletedExecutionInstruction::SetTriggerError
                }
                JobErrorDirective::MarkAllTriggersError => {
                    return CompletedExecutionInstruction::SetAllJobTriggersError
                }
                JobErrorDirective::None => {}
            }
        }

        if self.may_fire_again() {
            CompletedExecutionInstruction::Noop
        } else {
            CompletedExecutionInstruction::DeleteTrigger
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.key.name().trim().is_empty() {
            return Err(SchedulerError::Validation("触发器名称不能为空".to_string()));
        }
        if self.job_key.name().trim().is_empty() {
            return Err(SchedulerError::Validation(format!(
                "触发器 {} 未关联作业",
                self.key
            )));
        }
        if let Some(end) = self.times.end_time {
            if end < self.times.start_time {
                return Err(SchedulerError::Validation(format!(
                    "触发器 {} 的结束时间早于开始时间",
                    self.key
                )));
            }
        }
        let rule = self.schedule.rule();
        if !rule.is_valid_misfire_instruction(self.misfire_instruction) {
            return Err(SchedulerError::Validation(format!(
                "触发器 {} 不支持错过触发策略 {}",
                self.key, self.misfire_instruction
            )));
        }
        rule.validate()
    }
}

/// 跳过被日历排除的候选时间
pub(crate) fn skip_excluded<F>(
    fire_time_after: F,
    mut candidate: Option<DateTime<Utc>>,
    calendar: Option<&Calendar>,
) -> Option<DateTime<Utc>>
where
    F: Fn(DateTime<Utc>) -> Option<DateTime<Utc>>,
{
    let Some(calendar) = calendar else {
        return candidate;
    };
    while let Some(time) = candidate {
        if calendar.is_time_included(time) {
            break;
        }
        candidate = fire_time_after(time);
        if let Some(next) = candidate {
            if next.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
        }
    }
    candidate
}

/// Trigger 构建器
#[derive(Debug, Clone)]
pub struct TriggerBuilder {
    key: Option<TriggerKey>,
    job_key: Option<JobKey>,
    description: Option<String>,
    calendar_name: Option<String>,
    data_map: JobDataMap,
    priority: i32,
    misfire_instruction: MisfireInstruction,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    schedule: Option<Schedule>,
}

impl Default for TriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerBuilder {
    pub fn new() -> Self {
        Self {
            key: None,
            job_key: None,
            description: None,
            calendar_name: None,
            data_map: JobDataMap::new(),
            priority: DEFAULT_PRIORITY,
            misfire_instruction: MisfireInstruction::SmartPolicy,
            start_time: None,
            end_time: None,
            schedule: None,
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.key = Some(TriggerKey::new(name, group));
        self
    }

    pub fn with_key(mut self, key: TriggerKey) -> Self {
        self.key = Some(key);
        self
    }

    pub fn for_job(mut self, job_key: JobKey) -> Self {
        self.job_key = Some(job_key);
        self
    }

    pub fn for_job_named(self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.for_job(JobKey::new(name, group))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn modified_by_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    pub fn using_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data_map.put(key, value);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    pub fn start_at(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn start_now(mut self) -> Self {
        self.start_time = Some(Utc::now());
        self
    }

    pub fn end_at(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<Schedule>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// 未指定调度规则时默认为立即触发一次
    pub fn build(self) -> Trigger {
        Trigger {
            key: self.key.unwrap_or_else(|| TriggerKey::unique(DEFAULT_GROUP)),
            job_key: self
                .job_key
                .unwrap_or_else(|| JobKey::new("", DEFAULT_GROUP)),
            description: self.description,
            calendar_name: self.calendar_name,
            data_map: self.data_map,
            priority: self.priority,
            misfire_instruction: self.misfire_instruction,
            times: FireTimes {
                start_time: self.start_time.unwrap_or_else(Utc::now),
                end_time: self.end_time,
                next_fire_time: None,
                previous_fire_time: None,
            },
            schedule: self
                .schedule
                .unwrap_or_else(|| Schedule::Simple(SimpleSchedule::once())),
            fire_instance_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::SimpleSchedule;

    fn base() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_execution_complete_maps_directives() {
        let mut trigger = Trigger::builder()
            .with_identity("t", "g")
            .for_job_named("j", "g")
            .start_at(base())
            .build();
        trigger.compute_first_fire_time(None);

        assert_eq!(
            trigger.execution_complete(None),
            CompletedExecutionInstruction::Noop
        );
        let refire = JobExecutionError::refire_immediately("again");
        assert_eq!(
            trigger.execution_complete(Some(&refire)),
            CompletedExecutionInstruction::ReExecuteJob
        );

        trigger.triggered(None);
        assert!(!trigger.may_fire_again());
        assert_eq!(
            trigger.execution_complete(None),
            CompletedExecutionInstruction::DeleteTrigger
        );
        let plain = JobExecutionError::new("boom");
        assert_eq!(
            trigger.execution_complete(Some(&plain)),
            CompletedExecutionInstruction::DeleteTrigger
        );
    }

    #[test]
    fn test_validate_rejects_unsupported_misfire_instruction() {
        let trigger = Trigger::builder()
            .with_identity("t", "g")
            .for_job_named("j", "g")
            .with_schedule(SimpleSchedule::once())
            .with_misfire_instruction(MisfireInstruction::DoNothing)
            .build();
        assert!(matches!(
            trigger.validate(),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_requires_job() {
        let trigger = Trigger::builder().with_identity("t", "g").build();
        assert!(trigger.validate().is_err());
    }

    #[test]
    fn test_instruction_round_trips_through_text() {
        for instruction in [
            MisfireInstruction::SmartPolicy,
            MisfireInstruction::RescheduleNextWithRemainingCount,
        ] {
            assert_eq!(
                instruction.as_str().parse::<MisfireInstruction>().unwrap(),
                instruction
            );
        }
        assert!("BOGUS".parse::<CompletedExecutionInstruction>().is_err());
    }
}
