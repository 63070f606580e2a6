
use std::sync::Arc;

use chrono::{Duration, Utc};
use scheduler_core::{
    JobDetail, JobStore, NoopSignaler, Scheduler, SchedulerError, TriggerFiredResult,
};
use scheduler_dispatcher::SchedulerBuilder;
use scheduler_infrastructure::SqliteJobStore;
use scheduler_test_utils::*;
use tempfile::TempDir;

#[tokio::test]
async fn test_sqlite_scheduler_fires_and_persists_across_restart() {
    let dir = TempDir::new().unwrap();
    let tracker = Tracker::new();
    let scheduler = started_scheduler(sqlite_config("persistent", &dir), &tracker).await;

    let job = JobDetail::builder("counter_data")
        .with_identity("counter", "jobs")
        .store_durably(true)
        .disallow_concurrent_execution(true)
        .persist_data_after_execution(true)
        .build();
    scheduler
        .schedule_job(&job, &repeating("twice", &job.key, 100, 1))
        .await
        .unwrap();
    let later = once_at("tomorrow", &job.key, 86_400_000);
    scheduler.schedule_trigger(&later).await.unwrap();

    assert!(eventually(10_000, || async { tracker.executions() == 2 }).await);
    let metadata = scheduler.metadata().await.unwrap();
    assert_eq!(metadata.job_store, "SqliteJobStore");
    assert!(metadata.job_store_supports_persistence);
    scheduler.shutdown(true).await.unwrap();

    // 重启后作业、剩余触发器和持久化的作业数据都还在
    let restarted = SchedulerBuilder::new(sqlite_config("persistent", &dir))
        .with_job_factory(tracking_factory(&tracker))
        .build()
        .await
        .unwrap();
    assert!(restarted.check_job_exists(&job.key).await.unwrap());
    assert!(restarted.check_trigger_exists(&later.key).await.unwrap());
    let stored = restarted.get_job_detail(&job.key).await.unwrap().unwrap();
    assert_eq!(stored.data_map.get_i64("count"), Some(2));
    restarted.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn test_sqlite_scheduler_rejects_duplicates() {
    let dir = TempDir::new().unwrap();
    let tracker = Tracker::new();
    let scheduler = started_scheduler(sqlite_config("duplicates", &dir), &tracker).await;

    let job = JobDetail::builder("counting")
        .with_identity("dup", "jobs")
        .store_durably(true)
        .build();
    scheduler.add_job(&job, false).await.unwrap();
    let err = scheduler.add_job(&job, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists(_)));
    scheduler.add_job(&job, true).await.unwrap();

    scheduler.trigger_job(&job.key, None).await.unwrap();
    assert!(eventually(5_000, || async { tracker.executions() == 1 }).await);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_job_interrupted_by_crash_runs_once_as_recovery() {
    let dir = TempDir::new().unwrap();
    let config = sqlite_config("crashing", &dir);
    let job = JobDetail::builder("recovery_aware")
        .with_identity("nightly", "jobs")
        .requests_recovery(true)
        .build();
    let mut trigger = repeating("nightly-trigger", &job.key, 3_600_000, 5);
    trigger.compute_first_fire_time(None);

    {
        let store = SqliteJobStore::new_embedded(
            &config.job_store,
            &config.scheduler.instance_name,
            &config.resolve_instance_id(),
        )
        .await
        .unwrap();
        store.initialize(Arc::new(NoopSignaler)).await.unwrap();
        store.store_job_and_trigger(&job, &trigger).await.unwrap();
        let acquired = store
            .acquire_next_triggers(Utc::now() + Duration::seconds(1), 1, Duration::zero())
            .await
            .unwrap();
        assert_eq!(acquired.len(), 1);
        let fired = store.triggers_fired(&acquired).await.unwrap();
        assert!(matches!(fired[0], TriggerFiredResult::Fired(_)));
        // 作业执行到一半进程退出，完成回写从未发生
        store.shutdown().await.unwrap();
    }

    let tracker = Tracker::new();
    let scheduler = started_scheduler(config, &tracker).await;
    assert!(eventually(10_000, || async { tracker.executions() == 1 }).await);
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    assert_eq!(tracker.executions(), 1);
    assert_eq!(tracker.seen(), vec![format!("recovered:{}", trigger.key)]);
    assert!(scheduler
        .job_store()
        .get_fired_trigger_records()
        .await
        .unwrap()
        .is_empty());
    scheduler.shutdown(true).await.unwrap();
}
