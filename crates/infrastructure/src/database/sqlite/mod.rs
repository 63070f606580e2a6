//! SQLite 作业存储

mod cluster;
pub mod delegate;
pub mod job_store;
pub mod mapping;
pub mod schema;

pub use delegate::{GroupKind, SchedulerStateRecord, SqliteDelegate};
pub use job_store::SqliteJobStore;
pub use mapping::RowState;
pub use schema::run_migrations;
