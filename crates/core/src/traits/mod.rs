pub mod job;
pub mod job_store;
pub mod listener;
pub mod scheduler;
pub mod signaler;

pub use job::{InterruptHandle, Job, JobExecutionContext, JobFactory};
pub use job_store::JobStore;
pub use listener::{JobListener, SchedulerListener, TriggerListener};
pub use scheduler::{ExecutingJob, Scheduler, SchedulerMetaData};
pub use signaler::{NoopSignaler, SchedulerSignaler};
