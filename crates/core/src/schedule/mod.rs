//! # 调度规则
//!
//! 每种触发器变体对应一种调度规则，[`Schedule`] 以带标签的枚举承载具体参数，
//! 通过 [`ScheduleRule`] 统一计算触发时间。
//!
//! - [`SimpleSchedule`]：固定间隔，可限定重复次数
//! - [`CronSchedule`]：CRON 表达式（UTC）
//! - [`CalendarIntervalSchedule`]：按日历单位（秒到年）的间隔

mod calendar_interval;
mod cron_schedule;
mod simple;

pub use calendar_interval::{CalendarIntervalSchedule, IntervalUnit};
pub use cron_schedule::{CronExpression, CronSchedule};
pub use simple::{SimpleSchedule, REPEAT_INDEFINITELY};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::models::{FireTimes, MisfireInstruction, Trigger};
use crate::SchedulerResult;

/// 调度规则的统一计算接口
pub trait ScheduleRule: Send + Sync {
    /// 严格晚于 `after` 的下一次触发时间，遵守开始/结束时间，不考虑日历
    fn fire_time_after(&self, times: &FireTimes, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    /// 不考虑日历时的首次触发时间
    fn first_fire_time(&self, times: &FireTimes) -> Option<DateTime<Utc>> {
        Some(times.start_time)
    }

    fn final_fire_time(&self, times: &FireTimes) -> Option<DateTime<Utc>>;

    /// 记录一次实际触发
    fn record_fired(&mut self) {}

    fn is_valid_misfire_instruction(&self, instruction: MisfireInstruction) -> bool;

    /// 按策略修正错过触发的触发器；`IgnoreMisfirePolicy` 不做任何修改
    fn update_after_misfire(
        &mut self,
        times: &mut FireTimes,
        instruction: MisfireInstruction,
        calendar: Option<&Calendar>,
        now: DateTime<Utc>,
    );

    fn validate(&self) -> SchedulerResult<()>;
}

/// 触发器的调度规则，按 `kind` 标签区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Simple(SimpleSchedule),
    Cron(CronSchedule),
    CalendarInterval(CalendarIntervalSchedule),
}

impl Schedule {
    pub fn kind(&self) -> &'static str {
        match self {
            Schedule::Simple(_) => "simple",
            Schedule::Cron(_) => "cron",
            Schedule::CalendarInterval(_) => "calendar_interval",
        }
    }

    pub fn rule(&self) -> &dyn ScheduleRule {
        match self {
            Schedule::Simple(s) => s,
            Schedule::Cron(s) => s,
            Schedule::CalendarInterval(s) => s,
        }
    }

    pub fn rule_mut(&mut self) -> &mut dyn ScheduleRule {
        match self {
            Schedule::Simple(s) => s,
            Schedule::Cron(s) => s,
            Schedule::CalendarInterval(s) => s,
        }
    }
}

impl From<SimpleSchedule> for Schedule {
    fn from(schedule: SimpleSchedule) -> Self {
        Schedule::Simple(schedule)
    }
}

impl From<CronSchedule> for Schedule {
    fn from(schedule: CronSchedule) -> Self {
        Schedule::Cron(schedule)
    }
}

impl From<CalendarIntervalSchedule> for Schedule {
    fn from(schedule: CalendarIntervalSchedule) -> Self {
        Schedule::CalendarInterval(schedule)
    }
}

/// 预览触发器接下来的至多 `count` 次触发时间，不修改原触发器
pub fn compute_fire_times(
    trigger: &Trigger,
    calendar: Option<&Calendar>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    let mut preview = trigger.clone();
    preview.compute_first_fire_time(calendar);

    let mut fire_times = Vec::with_capacity(count);
    for _ in 0..count {
        match preview.next_fire_time() {
            Some(next) => {
                fire_times.push(next);
                preview.triggered(calendar);
            }
            None => break,
        }
    }
    fire_times
}
