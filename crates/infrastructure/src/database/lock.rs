//! 存储锁
//!
//! 数据库存储的写操作都在事务中先取得命名锁再执行：
//! - [`UpdateLockRowSemaphore`] 通过更新 `locks` 表中的锁行取得数据库写锁，跨进程有效
//! - [`SimpleSemaphore`] 只在进程内互斥，适合单实例部署

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use scheduler_core::config::{JobStoreSection, LockHandlerKind};
use scheduler_core::{SchedulerError, SchedulerResult};
use sqlx::SqliteConnection;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::observability::{MetricsCollector, StructuredLogger};

/// 触发器相关写操作的锁
pub const LOCK_TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";
/// 集群签到与实例状态的锁
pub const LOCK_STATE_ACCESS: &str = "STATE_ACCESS";

/// 持有期间锁有效；行锁随事务提交或回滚释放
#[derive(Debug)]
pub struct LockGuard {
    lock_name: String,
    _in_process: Option<OwnedMutexGuard<()>>,
}

impl LockGuard {
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }
}

#[async_trait]
pub trait Semaphore: Send + Sync {
    /// 在给定连接（已开启事务）上取得命名锁
    async fn obtain_lock(
        &self,
        conn: &mut SqliteConnection,
        lock_name: &str,
    ) -> SchedulerResult<LockGuard>;

    /// 锁是否依赖数据库连接
    fn requires_connection(&self) -> bool;
}

pub fn semaphore_from_config(config: &JobStoreSection, sched_name: &str) -> Arc<dyn Semaphore> {
    match config.lock_handler {
        LockHandlerKind::RowLock => Arc::new(UpdateLockRowSemaphore::new(
            sched_name,
            config.max_lock_retry,
            config.lock_retry_interval(),
        )),
        LockHandlerKind::InProcess => Arc::new(SimpleSemaphore::new()),
    }
}

/// 基于锁行更新的数据库锁
pub struct UpdateLockRowSemaphore {
    sched_name: String,
    max_retry: u32,
    retry_interval: Duration,
    metrics: MetricsCollector,
}

impl UpdateLockRowSemaphore {
    pub fn new(sched_name: impl Into<String>, max_retry: u32, retry_interval: Duration) -> Self {
        Self {
            sched_name: sched_name.into(),
            max_retry: max_retry.max(1),
            retry_interval,
            metrics: MetricsCollector::new(),
        }
    }

    async fn try_lock_row(&self, conn: &mut SqliteConnection, lock_name: &str) -> SchedulerResult<()> {
        let updated = sqlx::query(
            "UPDATE locks SET lock_name = lock_name WHERE sched_name = ? AND lock_name = ?",
        )
        .bind(&self.sched_name)
        .bind(lock_name)
        .execute(&mut *conn)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query("INSERT INTO locks (sched_name, lock_name) VALUES (?, ?)")
                .bind(&self.sched_name)
                .bind(lock_name)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Semaphore for UpdateLockRowSemaphore {
    async fn obtain_lock(
        &self,
        conn: &mut SqliteConnection,
        lock_name: &str,
    ) -> SchedulerResult<LockGuard> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_retry {
            match self.try_lock_row(conn, lock_name).await {
                Ok(()) => {
                    debug!("取得数据库锁 {}", lock_name);
                    return Ok(LockGuard {
                        lock_name: lock_name.to_string(),
                        _in_process: None,
                    });
                }
                Err(e) => {
                    last_error = e.to_string();
                    StructuredLogger::log_lock_contention(
                        lock_name,
                        attempt,
                        self.max_retry,
                        &last_error,
                    );
                    self.metrics.record_lock_retry();
                    if attempt < self.max_retry {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
            }
        }

        Err(SchedulerError::LockContention {
            lock_name: lock_name.to_string(),
            message: last_error,
        })
    }

    fn requires_connection(&self) -> bool {
        true
    }
}

/// 进程内互斥锁
#[derive(Default)]
pub struct SimpleSemaphore {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SimpleSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, lock_name: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(lock_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl Semaphore for SimpleSemaphore {
    async fn obtain_lock(
        &self,
        _conn: &mut SqliteConnection,
        lock_name: &str,
    ) -> SchedulerResult<LockGuard> {
        let guard = self.lock_for(lock_name).lock_owned().await;
        debug!("取得进程内锁 {}", lock_name);
        Ok(LockGuard {
            lock_name: lock_name.to_string(),
            _in_process: Some(guard),
        })
    }

    fn requires_connection(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Connection;

    #[tokio::test]
    async fn test_simple_semaphore_serializes_holders() {
        let semaphore = Arc::new(SimpleSemaphore::new());
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();

        let first = semaphore
            .obtain_lock(&mut conn, LOCK_TRIGGER_ACCESS)
            .await
            .unwrap();
        assert_eq!(first.lock_name(), LOCK_TRIGGER_ACCESS);

        let contender = semaphore.clone();
        let waiter = tokio::spawn(async move {
            let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
            contender
                .obtain_lock(&mut conn, LOCK_TRIGGER_ACCESS)
                .await
                .map(|guard| guard.lock_name().to_string())
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(first);
        assert_eq!(waiter.await.unwrap().unwrap(), LOCK_TRIGGER_ACCESS);
    }

    #[tokio::test]
    async fn test_row_semaphore_creates_missing_lock_row() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        sqlx::query("CREATE TABLE locks (sched_name TEXT NOT NULL, lock_name TEXT NOT NULL, PRIMARY KEY (sched_name, lock_name))")
            .execute(&mut conn)
            .await
            .unwrap();

        let semaphore = UpdateLockRowSemaphore::new("test", 3, Duration::from_millis(10));
        semaphore
            .obtain_lock(&mut conn, LOCK_STATE_ACCESS)
            .await
            .unwrap();
        semaphore
            .obtain_lock(&mut conn, LOCK_STATE_ACCESS)
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM locks")
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_row_semaphore_reports_contention_after_retries() {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        let semaphore = UpdateLockRowSemaphore::new("test", 2, Duration::from_millis(1));

        let err = semaphore
            .obtain_lock(&mut conn, LOCK_TRIGGER_ACCESS)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::LockContention { .. }));
    }
}
