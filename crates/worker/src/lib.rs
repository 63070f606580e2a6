//! # scheduler-worker
//!
//! 作业执行侧：有界工作池、作业工厂、内置作业以及单次触发的执行外壳。

pub mod job_factory;
pub mod job_run_shell;
pub mod jobs;
pub mod pool;

pub use job_factory::{JobConstructor, SimpleJobFactory};
pub use job_run_shell::{JobRunShell, RunShellHost};
pub use jobs::{NativeJob, NoOpJob};
pub use pool::WorkerPool;
