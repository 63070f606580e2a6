use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use scheduler_infrastructure::MetricsCollector;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// 有界工作池
///
/// 最多同时运行 `size` 个作业；`run_in_thread` 在没有空闲位置时立即返回 false，
/// 由调度循环决定释放触发器还是稍后重试。
pub struct WorkerPool {
    size: usize,
    permits: Arc<Semaphore>,
    busy: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    shutdown: AtomicBool,
    metrics: MetricsCollector,
}

/// 任务结束（包括 panic）时归还名额并更新计数
struct BusyGuard {
    _permit: OwnedSemaphorePermit,
    busy: Arc<AtomicUsize>,
    idle: Arc<Notify>,
    metrics: MetricsCollector,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let remaining = self.busy.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.update_busy_workers(remaining);
        if remaining == 0 {
            self.idle.notify_waiters();
        }
    }
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        info!("创建工作池，容量: {}", size);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            busy: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
            shutdown: AtomicBool::new(false),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.size
    }

    pub fn busy_count(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 等待直到至少有一个空闲位置，返回当前空闲数；关闭后返回 0
    pub async fn block_for_available_threads(&self) -> usize {
        if self.shutdown.load(Ordering::SeqCst) {
            return 0;
        }
        match self.permits.acquire().await {
            Ok(permit) => {
                drop(permit);
                self.permits.available_permits()
            }
            Err(_) => 0,
        }
    }

    /// 提交一个作业；没有空闲位置或已关闭时返回 false
    pub fn run_in_thread<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("工作池已满，拒绝提交");
                return false;
            }
        };

        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.update_busy_workers(busy);
        let guard = BusyGuard {
            _permit: permit,
            busy: self.busy.clone(),
            idle: self.idle.clone(),
            metrics: self.metrics.clone(),
        };

        tokio::spawn(async move {
            let _guard = guard;
            task.await;
        });
        true
    }

    /// 关闭工作池，不再接受新作业；`wait_for_jobs` 时等待正在运行的作业结束
    pub async fn shutdown(&self, wait_for_jobs: bool) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();

        if wait_for_jobs {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.busy_count() == 0 {
                    break;
                }
                debug!("等待 {} 个正在运行的作业结束", self.busy_count());
                notified.await;
            }
            info!("工作池已关闭，所有作业已结束");
        } else if self.busy_count() > 0 {
            warn!("工作池关闭时仍有 {} 个作业在运行", self.busy_count());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_rejects_when_full() {
        let pool = WorkerPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        assert!(pool.run_in_thread(async move {
            let _ = release_rx.await;
        }));
        assert!(!pool.run_in_thread(async {}));
        assert_eq!(pool.busy_count(), 1);

        release_tx.send(()).unwrap();
        assert_eq!(pool.block_for_available_threads().await, 1);
        assert!(pool.run_in_thread(async {}));
    }

    #[tokio::test]
    async fn test_graceful_shutdown_waits_for_running_jobs() {
        let pool = WorkerPool::new(2);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        assert!(pool.run_in_thread(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        }));

        pool.shutdown(true).await;
        assert!(finished.load(Ordering::SeqCst));
        assert!(!pool.run_in_thread(async {}));
        assert_eq!(pool.block_for_available_threads().await, 0);
    }
}
