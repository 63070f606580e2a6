use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::models::trigger::{skip_excluded, YEAR_TO_GIVE_UP_SCHEDULING_AT};
use crate::models::{FireTimes, MisfireInstruction};
use crate::schedule::ScheduleRule;
use crate::{SchedulerError, SchedulerResult};

/// 无限重复
pub const REPEAT_INDEFINITELY: i32 = -1;

/// 固定间隔调度：从开始时间起每隔 `repeat_interval_ms` 触发一次，
/// 共触发 `repeat_count + 1` 次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimpleSchedule {
    pub repeat_count: i32,
    pub repeat_interval_ms: i64,
    #[serde(default)]
    pub times_triggered: i32,
}

impl SimpleSchedule {
    /// 只触发一次
    pub fn once() -> Self {
        Self {
            repeat_count: 0,
            repeat_interval_ms: 0,
            times_triggered: 0,
        }
    }

    pub fn repeat(interval: Duration, repeat_count: i32) -> Self {
        Self {
            repeat_count,
            repeat_interval_ms: interval.num_milliseconds(),
            times_triggered: 0,
        }
    }

    pub fn repeat_forever(interval: Duration) -> Self {
        Self::repeat(interval, REPEAT_INDEFINITELY)
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::milliseconds(self.repeat_interval_ms)
    }

    /// `start` 与 `end` 之间完整间隔的个数
    pub fn num_times_fired_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i32 {
        if self.repeat_interval_ms < 1 {
            return 0;
        }
        let elapsed = (end - start).num_milliseconds();
        i32::try_from(elapsed / self.repeat_interval_ms).unwrap_or(i32::MAX)
    }

    /// 严格早于 `end` 的最后一次触发时间
    fn fire_time_before(&self, times: &FireTimes, end: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if end <= times.start_time {
            return None;
        }
        if self.repeat_interval_ms < 1 {
            return Some(times.start_time);
        }
        let elapsed = (end - times.start_time).num_milliseconds() - 1;
        let fired = elapsed / self.repeat_interval_ms;
        self.nth_fire_time(times.start_time, fired)
    }

    /// 第 `n` 次重复的触发时间，溢出或超过放弃年份时为 None
    fn nth_fire_time(&self, start: DateTime<Utc>, n: i64) -> Option<DateTime<Utc>> {
        let offset = Duration::try_milliseconds(n.checked_mul(self.repeat_interval_ms)?)?;
        start
            .checked_add_signed(offset)
            .filter(|t| t.year() <= YEAR_TO_GIVE_UP_SCHEDULING_AT)
    }

    fn next_after_now(
        &self,
        times: &FireTimes,
        calendar: Option<&Calendar>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let first = self.fire_time_after(times, now);
        skip_excluded(|t| self.fire_time_after(times, t), first, calendar)
    }

    /// 以 `now` 为新的开始时间重新排期
    fn reschedule_now(&mut self, times: &mut FireTimes, now: DateTime<Utc>, repeat_count: i32) {
        if self.repeat_count != 0 && self.repeat_count != REPEAT_INDEFINITELY {
            self.repeat_count = repeat_count.max(0);
            self.times_triggered = 0;
        }
        match times.end_time {
            Some(end) if end < now => times.next_fire_time = None,
            _ => {
                times.start_time = now;
                times.next_fire_time = Some(now);
            }
        }
    }
}

impl ScheduleRule for SimpleSchedule {
    fn fire_time_after(&self, times: &FireTimes, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.times_triggered > self.repeat_count && self.repeat_count != REPEAT_INDEFINITELY {
            return None;
        }
        if self.repeat_count == 0 && after >= times.start_time {
            return None;
        }
        if let Some(end) = times.end_time {
            if end <= after {
                return None;
            }
        }
        if after < times.start_time {
            return Some(times.start_time);
        }
        if self.repeat_interval_ms < 1 {
            return None;
        }

        let elapsed = (after - times.start_time).num_milliseconds();
        let num_fires = elapsed / self.repeat_interval_ms + 1;
        if num_fires > i64::from(self.repeat_count) && self.repeat_count != REPEAT_INDEFINITELY {
            return None;
        }

        let next = self.nth_fire_time(times.start_time, num_fires)?;
        match times.end_time {
            Some(end) if end <= next => None,
            _ => Some(next),
        }
    }

    fn final_fire_time(&self, times: &FireTimes) -> Option<DateTime<Utc>> {
        if self.repeat_count == 0 {
            return Some(times.start_time);
        }
        if self.repeat_count == REPEAT_INDEFINITELY {
            return times
                .end_time
                .and_then(|end| self.fire_time_before(times, end));
        }
        let last = self.nth_fire_time(times.start_time, i64::from(self.repeat_count))?;
        match times.end_time {
            Some(end) if last >= end => self.fire_time_before(times, end),
            _ => Some(last),
        }
    }

    fn record_fired(&mut self) {
        self.times_triggered += 1;
    }

    fn is_valid_misfire_instruction(&self, instruction: MisfireInstruction) -> bool {
        !matches!(instruction, MisfireInstruction::DoNothing)
    }

    fn update_after_misfire(
        &mut self,
        times: &mut FireTimes,
        instruction: MisfireInstruction,
        calendar: Option<&Calendar>,
        now: DateTime<Utc>,
    ) {
        let instruction = match instruction {
            MisfireInstruction::IgnoreMisfirePolicy => return,
            MisfireInstruction::SmartPolicy => match self.repeat_count {
                0 => MisfireInstruction::FireOnceNow,
                REPEAT_INDEFINITELY => MisfireInstruction::RescheduleNextWithRemainingCount,
                _ => MisfireInstruction::RescheduleNowWithExistingRepeatCount,
            },
            MisfireInstruction::FireOnceNow if self.repeat_count != 0 => {
                MisfireInstruction::RescheduleNowWithRemainingRepeatCount
            }
            other => other,
        };

        match instruction {
            MisfireInstruction::FireOnceNow => {
                times.next_fire_time = Some(now);
            }
            MisfireInstruction::RescheduleNextWithExistingCount => {
                times.next_fire_time = self.next_after_now(times, calendar, now);
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                let next = self.next_after_now(times, calendar, now);
                if let (Some(next), Some(missed_from)) = (next, times.next_fire_time) {
                    let missed = self.num_times_fired_between(missed_from, next);
                    self.times_triggered = self.times_triggered.saturating_add(missed);
                }
                times.next_fire_time = next;
            }
            MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
                let remaining = self.repeat_count - self.times_triggered;
                self.reschedule_now(times, now, remaining);
            }
            MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
                let missed = times
                    .next_fire_time
                    .map(|next| self.num_times_fired_between(next, now))
                    .unwrap_or(0);
                let remaining = self.repeat_count - (self.times_triggered + missed);
                self.reschedule_now(times, now, remaining);
            }
            MisfireInstruction::SmartPolicy
            | MisfireInstruction::IgnoreMisfirePolicy
            | MisfireInstruction::DoNothing => {}
        }
    }

    fn validate(&self) -> SchedulerResult<()> {
        if self.repeat_count < REPEAT_INDEFINITELY {
            return Err(SchedulerError::InvalidSchedule(format!(
                "重复次数必须 >= 0 或为无限重复，当前为 {}",
                self.repeat_count
            )));
        }
        if self.repeat_count != 0 && self.repeat_interval_ms < 1 {
            return Err(SchedulerError::InvalidSchedule(
                "需要重复触发时间隔必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::Calendar;
    use crate::models::Trigger;
    use crate::schedule::Schedule;
    use chrono::{NaiveDate, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, 3, h, m, s).unwrap()
    }

    fn trigger(schedule: SimpleSchedule, start: DateTime<Utc>) -> Trigger {
        Trigger::builder()
            .with_identity("t", "g")
            .for_job_named("j", "g")
            .start_at(start)
            .with_schedule(schedule)
            .build()
    }

    #[test]
    fn test_repeat_sequence_stops_after_repeat_count() {
        let start = at(10, 0, 0);
        let mut t = trigger(SimpleSchedule::repeat(Duration::seconds(10), 2), start);
        assert_eq!(t.compute_first_fire_time(None), Some(start));

        t.triggered(None);
        assert_eq!(t.next_fire_time(), Some(at(10, 0, 10)));
        t.triggered(None);
        assert_eq!(t.next_fire_time(), Some(at(10, 0, 20)));
        t.triggered(None);
        assert_eq!(t.next_fire_time(), None);
        assert_eq!(t.previous_fire_time(), Some(at(10, 0, 20)));
        assert_eq!(t.final_fire_time(), Some(at(10, 0, 20)));
    }

    #[test]
    fn test_end_time_is_exclusive() {
        let start = at(10, 0, 0);
        let mut t = trigger(SimpleSchedule::repeat_forever(Duration::seconds(10)), start);
        t.times.end_time = Some(at(10, 0, 20));
        t.compute_first_fire_time(None);
        t.triggered(None);
        t.triggered(None);
        assert_eq!(t.next_fire_time(), None);
        assert_eq!(t.final_fire_time(), Some(at(10, 0, 10)));
    }

    #[test]
    fn test_smart_policy_reschedules_now_keeping_remaining_repeats() {
        let now = at(12, 0, 0);
        let start = now - Duration::milliseconds(100_000);
        let mut t = trigger(SimpleSchedule::repeat(Duration::milliseconds(2000), 2), start);
        t.compute_first_fire_time(None);

        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time(), Some(now));
        assert_eq!(t.start_time(), now);
        let Schedule::Simple(s) = &t.schedule else {
            panic!("unexpected schedule kind");
        };
        assert_eq!(s.repeat_count, 2);
        assert_eq!(s.times_triggered, 0);

        t.triggered(None);
        assert_eq!(t.next_fire_time(), Some(now + Duration::milliseconds(2000)));
    }

    #[test]
    fn test_remaining_repeat_count_never_negative() {
        let now = at(12, 0, 0);
        let start = now - Duration::milliseconds(100_000);
        let mut t = trigger(SimpleSchedule::repeat(Duration::milliseconds(2000), 2), start);
        t.misfire_instruction = MisfireInstruction::RescheduleNowWithRemainingRepeatCount;
        t.compute_first_fire_time(None);

        t.update_after_misfire(None, now);
        let Schedule::Simple(s) = &t.schedule else {
            panic!("unexpected schedule kind");
        };
        assert_eq!(s.repeat_count, 0);
        assert_eq!(t.next_fire_time(), Some(now));
    }

    #[test]
    fn test_smart_policy_for_indefinite_skips_to_next_slot() {
        let now = at(12, 0, 5);
        let start = at(12, 0, 0) - Duration::minutes(10);
        let mut t = trigger(SimpleSchedule::repeat_forever(Duration::minutes(1)), start);
        t.compute_first_fire_time(None);

        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time(), Some(at(12, 1, 0)));
        let Schedule::Simple(s) = &t.schedule else {
            panic!("unexpected schedule kind");
        };
        assert_eq!(s.times_triggered, 11);
    }

    #[test]
    fn test_one_shot_smart_policy_fires_now() {
        let now = at(12, 0, 0);
        let mut t = trigger(SimpleSchedule::once(), now - Duration::hours(1));
        t.compute_first_fire_time(None);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time(), Some(now));
    }

    #[test]
    fn test_ignore_policy_leaves_trigger_untouched() {
        let now = at(12, 0, 0);
        let start = now - Duration::hours(1);
        let mut t = trigger(SimpleSchedule::once(), start);
        t.misfire_instruction = MisfireInstruction::IgnoreMisfirePolicy;
        t.compute_first_fire_time(None);
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time(), Some(start));
    }

    #[test]
    fn test_calendar_exclusion_skips_fire_times() {
        let start = at(0, 0, 0);
        let mut t = trigger(SimpleSchedule::repeat_forever(Duration::days(1)), start);
        let holidays = Calendar::holiday([NaiveDate::from_ymd_opt(2030, 6, 3).unwrap()]);
        let first = t.compute_first_fire_time(Some(&holidays));
        assert_eq!(first, Some(Utc.with_ymd_and_hms(2030, 6, 4, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_huge_interval_ends_schedule_instead_of_overflowing() {
        let start = at(10, 0, 0);
        let mut t = trigger(
            SimpleSchedule::repeat(Duration::days(365 * 500_000), 3),
            start,
        );
        assert!(t.validate().is_ok());
        assert_eq!(t.compute_first_fire_time(None), Some(start));

        t.triggered(None);
        assert_eq!(t.previous_fire_time(), Some(start));
        assert_eq!(t.next_fire_time(), None);
        assert_eq!(t.final_fire_time(), None);
    }

    #[test]
    fn test_fire_times_past_give_up_year_are_dropped() {
        let start = at(10, 0, 0);
        let mut t = trigger(SimpleSchedule::repeat_forever(Duration::days(365 * 300)), start);
        t.compute_first_fire_time(None);
        t.triggered(None);
        assert_eq!(t.next_fire_time(), None);
    }

    #[test]
    fn test_validate_rejects_zero_interval_with_repeats() {
        let schedule = SimpleSchedule::repeat(Duration::zero(), 3);
        assert!(schedule.validate().is_err());
        assert!(SimpleSchedule::once().validate().is_ok());
    }
}
