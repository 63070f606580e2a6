use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::schedule::CronExpression;

/// 日历的排除规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarKind {
    /// 不排除任何时间
    Base,
    /// 每年的 (月, 日)
    Annual { excluded_days: BTreeSet<(u32, u32)> },
    Holiday { excluded_dates: BTreeSet<NaiveDate> },
    /// 每天的时间区间（含两端）；`invert` 时只包含区间内
    Daily {
        range_start: NaiveTime,
        range_end: NaiveTime,
        invert: bool,
    },
    /// 周一为 0
    Weekly { excluded_days: BTreeSet<u32> },
    Monthly { excluded_days: BTreeSet<u32> },
    Cron { expression: CronExpression },
}

impl CalendarKind {
    pub fn excludes(&self, time: DateTime<Utc>) -> bool {
        match self {
            CalendarKind::Base => false,
            CalendarKind::Annual { excluded_days } => {
                excluded_days.contains(&(time.month(), time.day()))
            }
            CalendarKind::Holiday { excluded_dates } => excluded_dates.contains(&time.date_naive()),
            CalendarKind::Daily {
                range_start,
                range_end,
                invert,
            } => {
                let t = time.time();
                let in_range = t >= *range_start && t <= *range_end;
                in_range != *invert
            }
            CalendarKind::Weekly { excluded_days } => {
                excluded_days.contains(&time.weekday().num_days_from_monday())
            }
            CalendarKind::Monthly { excluded_days } => excluded_days.contains(&time.day()),
            CalendarKind::Cron { expression } => expression.is_satisfied_by(time),
        }
    }

    /// 被排除的 `time` 之后最早可能被包含的时间
    pub(crate) fn next_boundary(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            CalendarKind::Base => time,
            CalendarKind::Annual { .. }
            | CalendarKind::Holiday { .. }
            | CalendarKind::Weekly { .. }
            | CalendarKind::Monthly { .. } => start_of_next_day(time),
            CalendarKind::Daily {
                range_start,
                range_end,
                invert,
            } => {
                if !*invert {
                    at_time_of_day(time.date_naive(), *range_end) + Duration::milliseconds(1)
                } else if time.time() < *range_start {
                    at_time_of_day(time.date_naive(), *range_start)
                } else {
                    at_time_of_day(time.date_naive() + Duration::days(1), *range_start)
                }
            }
            CalendarKind::Cron { .. } => {
                let truncated = time.with_nanosecond(0).unwrap_or(time);
                truncated + Duration::seconds(1)
            }
        }
    }
}

fn at_time_of_day(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(time))
}

fn start_of_next_day(time: DateTime<Utc>) -> DateTime<Utc> {
    at_time_of_day(time.date_naive() + Duration::days(1), NaiveTime::MIN)
}
