use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::models::trigger::skip_excluded;
use crate::models::{FireTimes, MisfireInstruction};
use crate::schedule::ScheduleRule;
use crate::{SchedulerError, SchedulerResult};

/// 已解析的 CRON 表达式，序列化时保留原始文本
#[derive(Clone)]
pub struct CronExpression {
    expression: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    pub fn parse(expression: &str) -> SchedulerResult<Self> {
        let schedule =
            cron::Schedule::from_str(expression).map_err(|e| SchedulerError::InvalidCron {
                expr: expression.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    /// 严格晚于 `after` 的第一个匹配时间（秒级精度）
    pub fn time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    pub fn is_satisfied_by(&self, time: DateTime<Utc>) -> bool {
        self.schedule.includes(time)
    }
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression")
            .field(&self.expression)
            .finish()
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Serialize for CronExpression {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for CronExpression {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let expression = String::deserialize(deserializer)?;
        CronExpression::parse(&expression).map_err(serde::de::Error::custom)
    }
}

/// CRON 调度（UTC）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    pub expression: CronExpression,
}

impl CronSchedule {
    pub fn new(expression: &str) -> SchedulerResult<Self> {
        Ok(Self {
            expression: CronExpression::parse(expression)?,
        })
    }
}

impl ScheduleRule for CronSchedule {
    fn fire_time_after(&self, times: &FireTimes, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after = if times.start_time > after {
            times.start_time - Duration::seconds(1)
        } else {
            after
        };
        if let Some(end) = times.end_time {
            if after >= end {
                return None;
            }
        }

        let next = self.expression.time_after(after)?;
        match times.end_time {
            Some(end) if next > end => None,
            _ => Some(next),
        }
    }

    fn first_fire_time(&self, times: &FireTimes) -> Option<DateTime<Utc>> {
        self.fire_time_after(times, times.start_time - Duration::seconds(1))
    }

    fn final_fire_time(&self, times: &FireTimes) -> Option<DateTime<Utc>> {
        // 只有设定了结束时间才有最后一次；从结束时间向前逐步扩大窗口查找
        let end = times.end_time?;
        let floor = times.start_time - Duration::seconds(1);
        let mut span = Duration::minutes(1);
        loop {
            let window_start = (end - span).max(floor);
            let mut last = None;
            let mut cursor = self.fire_time_after(times, window_start);
            while let Some(t) = cursor {
                last = Some(t);
                cursor = self.fire_time_after(times, t);
            }
            if last.is_some() || window_start == floor || span > Duration::days(5 * 366) {
                return last;
            }
            span = span * 2;
        }
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
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Trigger;
    use chrono::TimeZone;

    fn at(d: u32, h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 6, d, h, m, s).unwrap()
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let err = CronSchedule::new("not a cron").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
    }

    #[test]
    fn test_start_time_itself_can_fire() {
        let mut t = Trigger::builder()
            .with_identity("c", "g")
            .for_job_named("j", "g")
            .start_at(at(3, 10, 0, 0))
            .with_schedule(CronSchedule::new("0 0 * * * *").unwrap())
            .build();
        assert_eq!(t.compute_first_fire_time(None), Some(at(3, 10, 0, 0)));
        t.triggered(None);
        assert_eq!(t.next_fire_time(), Some(at(3, 11, 0, 0)));
    }

    #[test]
    fn test_end_time_stops_firing() {
        let mut t = Trigger::builder()
            .with_identity("c", "g")
            .for_job_named("j", "g")
            .start_at(at(3, 10, 0, 0))
            .end_at(at(3, 11, 30, 0))
            .with_schedule(CronSchedule::new("0 0 * * * *").unwrap())
            .build();
        t.compute_first_fire_time(None);
        t.triggered(None);
        t.triggered(None);
        assert_eq!(t.next_fire_time(), None);
        assert_eq!(t.final_fire_time(), Some(at(3, 11, 0, 0)));
    }

    #[test]
    fn test_misfire_policies() {
        let now = at(3, 12, 30, 0);
        let mut t = Trigger::builder()
            .with_identity("c", "g")
            .for_job_named("j", "g")
            .start_at(at(3, 10, 0, 0))
            .with_schedule(CronSchedule::new("0 0 * * * *").unwrap())
            .build();
        t.compute_first_fire_time(None);

        let mut smart = t.clone();
        smart.update_after_misfire(None, now);
        assert_eq!(smart.next_fire_time(), Some(now));

        t.misfire_instruction = MisfireInstruction::DoNothing;
        t.update_after_misfire(None, now);
        assert_eq!(t.next_fire_time(), Some(at(3, 13, 0, 0)));
    }

    #[test]
    fn test_serde_keeps_expression_text() {
        let schedule = CronSchedule::new("0 15 10 * * *").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert_eq!(json, r#"{"expression":"0 15 10 * * *"}"#);
        let back: CronSchedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }
}
