//! # 数据模型
//!
//! 作业调度引擎的核心数据结构。
//!
//! ## 核心模型
//!
//! ### JobDetail - 作业定义
//! 描述执行什么：作业类型、数据以及持久化、恢复、并发等属性。
//!
//! ### Trigger - 触发器
//! 描述何时执行：开始/结束时间、优先级、错过触发策略、可选日历以及调度规则。
//! 每个触发器只关联一个作业，一个作业可以被多个触发器触发。
//!
//! ### FiredTriggerRecord - 触发记录
//! 触发器被获取到作业执行完成之间的临时记录，用于检测和恢复被中断的执行。
//!
//! ## 设计原则
//! - 所有时间字段使用 `DateTime<Utc>`
//! - 键按 (分组, 名称) 排序，保证枚举结果确定
//! - 存储持有唯一的权威副本，调度器和执行器只操作克隆

mod data_map;
mod fired_trigger;
mod job;
mod key;
mod matcher;
pub mod trigger;

pub use data_map::JobDataMap;
pub use fired_trigger::{
    FiredTriggerRecord, FiredTriggerState, TriggerFiredBundle, TriggerFiredResult,
    FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME, FAILED_JOB_ORIGINAL_TRIGGER_GROUP,
    FAILED_JOB_ORIGINAL_TRIGGER_NAME, FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME,
};
pub use job::{JobBuilder, JobDetail};
pub use key::{JobKey, Keyed, TriggerKey, DEFAULT_GROUP};
pub use matcher::{GroupMatcher, Matcher, StringMatcher, StringOperator};
pub use trigger::{
    CompletedExecutionInstruction, FireTimes, MisfireInstruction, Trigger, TriggerBuilder,
    TriggerState, DEFAULT_PRIORITY, RECOVERING_JOBS_GROUP,
};
