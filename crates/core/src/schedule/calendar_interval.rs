use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::models::trigger::{skip_excluded, YEAR_TO_GIVE_UP_SCHEDULING_AT};
use crate::models::{FireTimes, MisfireInstruction};
use crate::schedule::ScheduleRule;
use crate::{SchedulerError, SchedulerResult};

/// 日历间隔单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    /// 固定长度单位的毫秒数；月和年返回 None
    fn fixed_millis(&self) -> Option<i64> {
        match self {
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            IntervalUnit::Day => Some(86_400_000),
            IntervalUnit::Week => Some(7 * 86_400_000),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }

    fn months(&self) -> i64 {
        match self {
            IntervalUnit::Year => 12,
            _ => 1,
        }
    }
}

/// 按日历单位重复：第 n 次触发时间 = 开始时间 + n * interval 个单位
///
/// 月/年按日历相加，日期超出目标月份时取该月最后一天。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarIntervalSchedule {
    pub interval: i32,
    pub unit: IntervalUnit,
    #[serde(default)]
    pub times_triggered: i32,
}

impl CalendarIntervalSchedule {
    pub fn new(interval: i32, unit: IntervalUnit) -> Self {
        Self {
            interval,
            unit,
            times_triggered: 0,
        }
    }

    fn nth_fire_time(&self, start: DateTime<Utc>, n: i64) -> Option<DateTime<Utc>> {
        let steps = n.checked_mul(i64::from(self.interval))?;
        match self.unit.fixed_millis() {
            Some(millis) => {
                start.checked_add_signed(Duration::milliseconds(steps.checked_mul(millis)?))
            }
            None => {
                let months = u32::try_from(steps.checked_mul(self.unit.months())?).ok()?;
                start.checked_add_months(Months::new(months))
            }
        }
    }

    /// 不晚于 `at` 的最大触发序号的估计值（可能偏小）
    fn estimate_index(&self, start: DateTime<Utc>, at: DateTime<Utc>) -> i64 {
        let interval = i64::from(self.interval.max(1));
        let estimate = match self.unit.fixed_millis() {
            Some(millis) => (at - start).num_milliseconds() / (interval * millis),
            None => {
                let months = i64::from(at.year() - start.year()) * 12 + i64::from(at.month())
                    - i64::from(start.month());
                months / (interval * self.unit.months()) - 1
            }
        };
        estimate.max(0)
    }
}

impl ScheduleRule for CalendarIntervalSchedule {
    fn fire_time_after(&self, times: &FireTimes, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(end) = times.end_time {
            if end <= after {
                return None;
            }
        }
        if after < times.start_time {
            return Some(times.start_time);
        }
        if self.interval < 1 {
            return None;
        }

        let mut n = self.estimate_index(times.start_time, after);
        let next = loop {
            let candidate = self.nth_fire_time(times.start_time, n)?;
            if candidate > after {
                break candidate;
            }
            if candidate.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            n += 1;
        };

        match times.end_time {
            Some(end) if end <= next => None,
            _ => Some(next),
        }
    }

    fn final_fire_time(&self, times: &FireTimes) -> Option<DateTime<Utc>> {
        let end = times.end_time?;
        if end <= times.start_time || self.interval < 1 {
            return None;
        }
        let mut n = self.estimate_index(times.start_time, end) + 1;
        while n >= 0 {
            if let Some(candidate) = self.nth_fire_time(times.start_time, n) {
                if candidate < end {
                    return Some(candidate);
                }
            }
            n -= 1;
        }
        None
    }

    fn record_fired(&mut self) {
        self.times_triggered += 1;
    }

    fn is_valid_misfire_instruction(&self, instruction: MisfireInstruction) -> bool {
        matches!(
            instruction,
            MisfireInstruction::SmartPolicy
                | MisfireInstruction::IgnoreMisfirePolicy
                | MisfireInstruction::FireOnceNow
                | MisfireInstruction::DoNothing
        )
    }

    fn update_after_misfire(
        &mut self,
        times: &mut FireTimes,
        instruction: MisfireInstruction,
        calendar: Option<&Calendar>,
        now: DateTime<Utc>,
    ) {
        match instruction {
            MisfireInstruction::IgnoreMisfirePolicy => {}
            MisfireInstruction::DoNothing => {
                let first = self.fire_time_after(times, now);
                times.next_fire_time =
                    skip_excluded(|t| self.fire_time_after(times, t), first, calendar);
            }
            _ => times.next_fire_time = Some(now),
        }
    }

    fn validate(&self) -> SchedulerResult<()> {
        if self.interval < 1 {
            return Err(SchedulerError::InvalidSchedule(format!(
                "日历间隔必须大于0，当前为 {}",
                self.interval
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trigger;
    use chrono::TimeZone;

    fn trigger(schedule: CalendarIntervalSchedule, start: DateTime<Utc>) -> Trigger {
        Trigger::builder()
            .with_identity("ci", "g")
            .for_job_named("j", "g")
            .start_at(start)
            .with_schedule(schedule)
            .build()
    }

    #[test]
    fn test_monthly_interval_clamps_to_month_end() {
        let start = Utc.with_ymd_and_hms(2030, 1, 31, 9, 0, 0).unwrap();
        let mut t = trigger(CalendarIntervalSchedule::new(1, IntervalUnit::Month), start);
        assert_eq!(t.compute_first_fire_time(None), Some(start));
        t.triggered(None);
        assert_eq!(
            t.next_fire_time(),
            Some(Utc.with_ymd_and_hms(2030, 2, 28, 9, 0, 0).unwrap())
        );
        t.triggered(None);
        assert_eq!(
            t.next_fire_time(),
            Some(Utc.with_ymd_and_hms(2030, 3, 31, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_fixed_unit_fire_time_after_is_strict() {
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let t = trigger(CalendarIntervalSchedule::new(2, IntervalUnit::Hour), start);
        assert_eq!(
            t.fire_time_after(start),
            Some(start + Duration::hours(2))
        );
        assert_eq!(
            t.fire_time_after(start + Duration::minutes(150)),
            Some(start + Duration::hours(4))
        );
    }

    #[test]
    fn test_yearly_final_fire_time_before_end() {
        let start = Utc.with_ymd_and_hms(2030, 3, 1, 0, 0, 0).unwrap();
        let mut t = trigger(CalendarIntervalSchedule::new(1, IntervalUnit::Year), start);
        t.times.end_time = Some(Utc.with_ymd_and_hms(2033, 3, 1, 0, 0, 0).unwrap());
        assert_eq!(
            t.final_fire_time(),
            Some(Utc.with_ymd_and_hms(2032, 3, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_do_nothing_skips_to_next_slot() {
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2030, 1, 10, 12, 0, 0).unwrap();
        let mut t = trigger(CalendarIntervalSchedule::new(1, IntervalUnit::Week), start);
        t.misfire_instruction = MisfireInstruction::DoNothing;
        t.compute_first_fire_time(None);
        t.update_after_misfire(None, now);
        assert_eq!(
            t.next_fire_time(),
            Some(Utc.with_ymd_and_hms(2030, 1, 15, 0, 0, 0).unwrap())
        );
    }
}
