//! # scheduler-dispatcher
//!
//! 调度器门面与调度循环：把作业存储、工作池和监听器组装成可运行的 [`StdScheduler`]。

pub mod builder;
pub mod listener_manager;
pub mod registry;
pub mod scheduler;
mod scheduler_loop;
pub mod signal;

pub use builder::SchedulerBuilder;
pub use listener_manager::ListenerManager;
pub use registry::SchedulerRegistry;
pub use scheduler::{SchedulerResources, StdScheduler, MANUAL_TRIGGER_GROUP};
pub use signal::{SchedulingChange, SchedulingSignal};
