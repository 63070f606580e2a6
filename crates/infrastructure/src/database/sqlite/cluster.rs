//! 集群签到与失效实例接管
//!
//! 每个实例按签到间隔更新 `scheduler_state` 中自己的行。某实例的上次签到时间
//! 加上 max(其签到间隔, 本实例距上次签到的时长) 再加 7.5 秒仍早于当前时间，
//! 即视为失效。首次签到时，本实例遗留的行和没有状态行却仍有触发记录的实例
//! 也一并视为失效。

use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use super::delegate::SchedulerStateRecord;
use super::job_store::{finish, StoreCore};
use crate::database::lock::{LockGuard, LOCK_STATE_ACCESS, LOCK_TRIGGER_ACCESS};
use crate::observability::StructuredLogger;

/// 签到判定的宽限时间
const CHECKIN_GRACE_MS: i64 = 7_500;

impl StoreCore {
    /// 签到循环，由调度器启动时创建的后台任务运行，关闭时被中止
    pub(super) async fn run_checkin_loop(&self) {
        let mut ticker = tokio::time::interval(self.checkin_interval);
        // 第一次 tick 立即返回，首次签到已在启动时完成
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.cluster_check_in(false).await {
                warn!("集群签到失败: {}", e);
                self.signaler()
                    .notify_scheduler_listeners_error("集群签到失败", &e);
            }
        }
    }

    /// 签到一次，返回接管的失效实例数；接管与签到在同一事务中完成
    pub(super) async fn cluster_check_in(&self, first_check_in: bool) -> SchedulerResult<usize> {
        let (mut tx, _state_lock) = self.begin(Some(LOCK_STATE_ACCESS)).await?;
        let result = self.check_in_within(&mut tx, first_check_in).await;
        let (failed, _trigger_lock) = match result {
            Ok(value) => value,
            Err(e) => return finish(tx, Err(e)).await,
        };
        let failed_count = finish(tx, Ok(failed)).await?;
        if failed_count > 0 {
            self.signaler().signal_scheduling_change(None);
        }
        Ok(failed_count)
    }

    async fn check_in_within(
        &self,
        conn: &mut SqliteConnection,
        first_check_in: bool,
    ) -> SchedulerResult<(usize, Option<LockGuard>)> {
        let now = Utc::now();
        let failed = self.find_failed_instances(conn, first_check_in, now).await?;

        let mut trigger_lock = None;
        let mut failed_count = 0;
        if !failed.is_empty() {
            trigger_lock = Some(self.semaphore.obtain_lock(conn, LOCK_TRIGGER_ACCESS).await?);
            failed_count = failed.len();
            self.cluster_recover(conn, &failed).await?;
        }

        self.delegate
            .update_scheduler_state(
                conn,
                &self.instance_id,
                now,
                self.checkin_interval.as_millis() as i64,
            )
            .await?;
        self.last_checkin_ms
            .store(now.timestamp_millis(), Ordering::SeqCst);
        debug!("实例 {} 完成集群签到", self.instance_id);

        Ok((failed_count, trigger_lock))
    }

    async fn find_failed_instances(
        &self,
        conn: &mut SqliteConnection,
        first_check_in: bool,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<SchedulerStateRecord>> {
        let states = self.delegate.select_scheduler_states(conn).await?;
        let since_own_checkin = now.timestamp_millis() - self.last_checkin_ms.load(Ordering::SeqCst);

        let mut failed = Vec::new();
        for state in &states {
            if state.instance_id == self.instance_id {
                if first_check_in {
                    failed.push(state.clone());
                }
                continue;
            }
            let failed_after = state.last_checkin.timestamp_millis()
                + state.checkin_interval_ms.max(since_own_checkin)
                + CHECKIN_GRACE_MS;
            if failed_after < now.timestamp_millis() {
                failed.push(state.clone());
            }
        }

        if first_check_in {
            for orphan in self.delegate.select_fired_instance_names(conn).await? {
                if !states.iter().any(|state| state.instance_id == orphan) {
                    info!("发现没有签到记录的实例 {} 遗留的触发记录", orphan);
                    failed.push(SchedulerStateRecord {
                        instance_id: orphan,
                        last_checkin: now,
                        checkin_interval_ms: 0,
                    });
                }
            }
        }
        Ok(failed)
    }

    async fn cluster_recover(
        &self,
        conn: &mut SqliteConnection,
        failed: &[SchedulerStateRecord],
    ) -> SchedulerResult<()> {
        let mut recovered = 0;
        for instance in failed {
            if instance.instance_id != self.instance_id {
                StructuredLogger::log_cluster_instance_failed(
                    &instance.instance_id,
                    instance.last_checkin,
                    instance.checkin_interval_ms,
                );
            }

            let records = self
                .delegate
                .select_instance_fired_records(conn, &instance.instance_id)
                .await?;
            recovered += self.recover_fired_records(conn, &records).await?;
            self.delegate
                .delete_instance_fired_records(conn, &instance.instance_id)
                .await?;
            if instance.instance_id != self.instance_id {
                self.delegate
                    .delete_scheduler_state(conn, &instance.instance_id)
                    .await?;
            }
            info!(
                "已接管实例 {} 的 {} 条触发记录",
                instance.instance_id,
                records.len()
            );
        }
        self.metrics.record_recovered_jobs(recovered);
        Ok(())
    }
}
