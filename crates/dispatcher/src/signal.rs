use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

/// 调度变更信号
///
/// 新增、恢复或修改触发器后，某个触发器的下次触发时间可能早于调度循环正在等待的时间。
/// 信号会立即唤醒调度循环，并记录最早的候选时间；`None` 表示时间未知，按“更早”处理。
#[derive(Debug, Default)]
pub struct SchedulingSignal {
    pending: Mutex<PendingChange>,
    notify: Notify,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingChange {
    signaled: bool,
    unknown: bool,
    earliest: Option<DateTime<Utc>>,
}

/// 一次被消费的变更
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingChange {
    /// 候选触发时间
    At(DateTime<Utc>),
    Unknown,
}

impl SchedulingChange {
    /// 是否早于 `time`
    pub fn is_earlier_than(&self, time: DateTime<Utc>) -> bool {
        match self {
            SchedulingChange::At(candidate) => *candidate < time,
            SchedulingChange::Unknown => true,
        }
    }
}

impl SchedulingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        {
            let mut pending = self.lock();
            pending.signaled = true;
            match candidate_new_next_fire_time {
                Some(time) => {
                    pending.earliest = Some(pending.earliest.map_or(time, |t| t.min(time)));
                }
                None => pending.unknown = true,
            }
        }
        self.notify.notify_one();
    }

    pub fn is_signaled(&self) -> bool {
        self.lock().signaled
    }

    /// 查看但不清除待处理的变更
    pub fn peek(&self) -> Option<SchedulingChange> {
        Self::change_of(&self.lock())
    }

    /// 取出并清除待处理的变更
    pub fn take(&self) -> Option<SchedulingChange> {
        let mut pending = self.lock();
        let change = Self::change_of(&pending);
        *pending = PendingChange::default();
        change
    }

    pub fn clear(&self) {
        *self.lock() = PendingChange::default();
    }

    /// 等待信号或超时，返回是否收到信号
    pub async fn wait(&self, timeout: Duration) -> bool {
        if self.is_signaled() {
            return true;
        }
        tokio::select! {
            _ = self.notify.notified() => self.is_signaled(),
            _ = tokio::time::sleep(timeout) => self.is_signaled(),
        }
    }

    fn change_of(pending: &PendingChange) -> Option<SchedulingChange> {
        if !pending.signaled {
            None
        } else if pending.unknown {
            Some(SchedulingChange::Unknown)
        } else {
            pending.earliest.map(SchedulingChange::At)
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingChange> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    #[test]
    fn test_keeps_earliest_candidate() {
        let signal = SchedulingSignal::new();
        let now = Utc::now();
        signal.signal(Some(now + ChronoDuration::seconds(10)));
        signal.signal(Some(now + ChronoDuration::seconds(5)));
        assert_eq!(
            signal.take(),
            Some(SchedulingChange::At(now + ChronoDuration::seconds(5)))
        );
        assert_eq!(signal.take(), None);
    }

    #[test]
    fn test_unknown_candidate_wins() {
        let signal = SchedulingSignal::new();
        signal.signal(Some(Utc::now()));
        signal.signal(None);
        let change = signal.peek().unwrap();
        assert_eq!(change, SchedulingChange::Unknown);
        assert!(change.is_earlier_than(Utc::now() - ChronoDuration::days(1)));
    }

    #[tokio::test]
    async fn test_signal_wakes_waiter() {
        let signal = Arc::new(SchedulingSignal::new());
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.wait(Duration::from_secs(30)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        signal.signal(None);
        let woke = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(woke);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_signal() {
        let signal = SchedulingSignal::new();
        assert!(!signal.wait(Duration::from_millis(10)).await);
    }
}
