//! # 日历
//!
//! 日历用于从触发器的调度中排除时间段。一个日历可以链接基础日历，
//! 只有双方都包含的时间才算被包含。
//!
//! 所有日历按 UTC 计算。

mod kinds;

pub use kinds::CalendarKind;

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::schedule::CronExpression;
use crate::{SchedulerError, SchedulerResult};

/// 查找下一个包含时间时的最大迭代次数
const MAX_NEXT_INCLUDED_STEPS: usize = 100_000;

/// 具名、可复用的时间排除规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Calendar {
    pub description: Option<String>,
    pub base_calendar: Option<Box<Calendar>>,
    pub kind: CalendarKind,
}

impl Calendar {
    pub fn new(kind: CalendarKind) -> Self {
        Self {
            description: None,
            base_calendar: None,
            kind,
        }
    }

    /// 不排除任何时间，通常作为基础日历
    pub fn base() -> Self {
        Self::new(CalendarKind::Base)
    }

    /// 每年固定的月/日被排除
    pub fn annual(days: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self::new(CalendarKind::Annual {
            excluded_days: days.into_iter().collect(),
        })
    }

    /// 指定日期整天被排除
    pub fn holiday(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self::new(CalendarKind::Holiday {
            excluded_dates: dates.into_iter().collect(),
        })
    }

    /// 每天 `range_start..=range_end` 之间被排除
    pub fn daily(range_start: NaiveTime, range_end: NaiveTime) -> SchedulerResult<Self> {
        if range_start >= range_end {
            return Err(SchedulerError::Validation(format!(
                "每日排除区间的开始 {} 必须早于结束 {}",
                range_start, range_end
            )));
        }
        Ok(Self::new(CalendarKind::Daily {
            range_start,
            range_end,
            invert: false,
        }))
    }

    /// 每周指定的星期被排除
    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> Self {
        let excluded_days: BTreeSet<u32> = days
            .into_iter()
            .map(|d| d.num_days_from_monday())
            .collect();
        Self::new(CalendarKind::Weekly { excluded_days })
    }

    /// 每月指定的日期（1..=31）被排除
    pub fn monthly(days: impl IntoIterator<Item = u32>) -> SchedulerResult<Self> {
        let excluded_days: BTreeSet<u32> = days.into_iter().collect();
        if let Some(bad) = excluded_days.iter().find(|d| !(1..=31).contains(*d)) {
            return Err(SchedulerError::Validation(format!(
                "每月排除日期必须在1到31之间，当前为 {}",
                bad
            )));
        }
        Ok(Self::new(CalendarKind::Monthly { excluded_days }))
    }

    /// 满足 CRON 表达式的时间被排除
    pub fn cron(expression: &str) -> SchedulerResult<Self> {
        Ok(Self::new(CalendarKind::Cron {
            expression: CronExpression::parse(expression)?,
        }))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_base_calendar(mut self, base: Calendar) -> Self {
        self.base_calendar = Some(Box::new(base));
        self
    }

    /// 反转每日日历：只包含区间内的时间
    pub fn inverted(mut self) -> Self {
        if let CalendarKind::Daily { invert, .. } = &mut self.kind {
            *invert = !*invert;
        }
        self
    }

    pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
        if let Some(base) = &self.base_calendar {
            if !base.is_time_included(time) {
                return false;
            }
        }
        !self.kind.excludes(time)
    }

    /// 严格晚于 `time` 的第一个被包含的时间
    pub fn next_included_time(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let mut candidate = time + Duration::milliseconds(1);
        for _ in 0..MAX_NEXT_INCLUDED_STEPS {
            if self.kind.excludes(candidate) {
                candidate = self.kind.next_boundary(candidate);
                continue;
            }
            if let Some(base) = &self.base_calendar {
                if !base.is_time_included(candidate) {
                    candidate = base.next_included_time(candidate);
                    continue;
                }
            }
            break;
        }
        candidate
    }
}
