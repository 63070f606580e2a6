pub mod lock;
pub mod sqlite;

pub use lock::{
    semaphore_from_config, LockGuard, Semaphore, SimpleSemaphore, UpdateLockRowSemaphore,
    LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS,
};
pub use sqlite::SqliteJobStore;
