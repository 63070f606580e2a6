//! # scheduler-core
//!
//! 作业调度引擎的核心定义：数据模型、调度规则、日历、错误类型、配置，
//! 以及存储、作业、监听器和调度器门面等协作接口。

pub mod calendar;
pub mod config;
pub mod errors;
pub mod models;
pub mod schedule;
pub mod traits;

pub use calendar::{Calendar, CalendarKind};
pub use config::SchedulerConfig;
pub use errors::{JobErrorDirective, JobExecutionError, SchedulerError, SchedulerResult};
pub use models::*;
pub use schedule::{
    compute_fire_times, CalendarIntervalSchedule, CronSchedule, IntervalUnit, Schedule,
    ScheduleRule, SimpleSchedule, REPEAT_INDEFINITELY,
};
pub use traits::*;
