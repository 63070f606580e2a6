mod job_store_test_utils;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use scheduler_core::config::{JobStoreKind, JobStoreSection};
use scheduler_core::{
    CompletedExecutionInstruction, FiredTriggerState, GroupMatcher, JobDetail, JobStore,
    SchedulerError, Trigger, TriggerFiredResult, TriggerState, FAILED_JOB_ORIGINAL_TRIGGER_NAME,
    RECOVERING_JOBS_GROUP,
};
use scheduler_infrastructure::SqliteJobStore;
use tempfile::TempDir;

use job_store_test_utils::*;

fn store_config(dir: &TempDir) -> JobStoreSection {
    JobStoreSection {
        kind: JobStoreKind::Sqlite,
        database_url: format!("sqlite://{}", dir.path().join("scheduler.db").display()),
        ..JobStoreSection::default()
    }
}

async fn open_store(config: &JobStoreSection, instance_id: &str) -> SqliteJobStore {
    let store = SqliteJobStore::new_embedded(config, "test-scheduler", instance_id)
        .await
        .unwrap();
    store.initialize(RecordingSignaler::new()).await.unwrap();
    store
}

async fn fire_one(store: &SqliteJobStore, no_later_than: chrono::DateTime<Utc>) -> Trigger {
    let acquired = store
        .acquire_next_triggers(no_later_than, 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    let bundle = store
        .triggers_fired(&acquired)
        .await
        .unwrap()
        .into_iter()
        .next()
        .and_then(TriggerFiredResult::into_bundle)
        .unwrap();
    bundle.trigger
}

#[tokio::test]
async fn test_store_and_retrieve_jobs_and_triggers() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;

    let jobs = varied_jobs();
    for (i, job) in jobs.iter().enumerate() {
        let trigger = once_trigger(&format!("trigger-{i}"), job, soon(), i as i32);
        store.store_job_and_trigger(job, &trigger).await.unwrap();
    }

    assert_eq!(store.get_number_of_jobs().await.unwrap(), 10);
    assert_eq!(store.get_number_of_triggers().await.unwrap(), 10);
    let keys = store
        .get_job_keys(&GroupMatcher::starts_with("batch-"))
        .await
        .unwrap();
    assert_eq!(keys.len(), 10);

    for (i, job) in jobs.iter().enumerate() {
        let stored = store.retrieve_job(&job.key).await.unwrap();
        assert_eq!(stored.as_ref(), Some(job));

        let triggers = store.get_triggers_for_job(&job.key).await.unwrap();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].priority, i as i32);
        assert!(triggers[0].next_fire_time().is_some());
    }
}

#[tokio::test]
async fn test_acquire_orders_by_fire_time_then_priority() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let base = soon();
    let job = job("report");
    store.store_job(&job, false).await.unwrap();
    store
        .store_trigger(&once_trigger("t1", &job, base + Duration::seconds(10), 5), false)
        .await
        .unwrap();
    store
        .store_trigger(&once_trigger("t2", &job, base, 5), false)
        .await
        .unwrap();
    store
        .store_trigger(&once_trigger("t3", &job, base, 10), false)
        .await
        .unwrap();

    let acquired = store
        .acquire_next_triggers(base + Duration::seconds(20), 3, Duration::zero())
        .await
        .unwrap();
    let names: Vec<&str> = acquired.iter().map(|t| t.key.name()).collect();
    assert_eq!(names, vec!["t3", "t2", "t1"]);
    assert_eq!(store.get_fired_trigger_records().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_concurrent_acquire_never_returns_duplicates() {
    let dir = TempDir::new().unwrap();
    let config = JobStoreSection {
        acquire_triggers_within_lock: true,
        ..store_config(&dir)
    };
    let store = Arc::new(open_store(&config, "node-1").await);
    let base = soon();
    let job = job("parallel");
    store.store_job(&job, false).await.unwrap();
    for i in 0..12 {
        store
            .store_trigger(&once_trigger(&format!("t{i:02}"), &job, base, 5), false)
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .acquire_next_triggers(base + Duration::seconds(1), 4, Duration::zero())
                .await
                .unwrap()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for trigger in handle.await.unwrap() {
            assert!(seen.insert(trigger.key.clone()), "重复获取 {}", trigger.key);
        }
    }
    assert_eq!(seen.len(), 12);
}

#[tokio::test]
async fn test_non_concurrent_job_blocks_sibling_triggers() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let base = soon();
    let job = non_concurrent_job("exclusive");
    store.store_job(&job, false).await.unwrap();
    let first = once_trigger("first", &job, base, 5);
    let second = repeating_trigger("second", &job, base);
    store.store_trigger(&first, false).await.unwrap();
    store.store_trigger(&second, false).await.unwrap();

    let fired = fire_one(&store, base + Duration::seconds(1)).await;
    assert_eq!(fired.key, first.key);
    assert_eq!(
        store.get_trigger_state(&second.key).await.unwrap(),
        TriggerState::Blocked
    );

    // 执行期间新加入的触发器同样被阻塞
    let third = once_trigger("third", &job, base, 5);
    store.store_trigger(&third, false).await.unwrap();
    assert_eq!(
        store.get_trigger_state(&third.key).await.unwrap(),
        TriggerState::Blocked
    );

    store
        .triggered_job_complete(&fired, &job, CompletedExecutionInstruction::DeleteTrigger)
        .await
        .unwrap();
    assert_eq!(
        store.get_trigger_state(&second.key).await.unwrap(),
        TriggerState::Normal
    );
    assert_eq!(
        store.get_trigger_state(&first.key).await.unwrap(),
        TriggerState::None
    );
}

#[tokio::test]
async fn test_misfired_trigger_is_handled_before_acquire() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let job = job("late");
    store.store_job(&job, false).await.unwrap();
    let missed = once_trigger("missed", &job, Utc::now() - Duration::minutes(5), 5);
    store.store_trigger(&missed, false).await.unwrap();

    let acquired = store
        .acquire_next_triggers(Utc::now() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    let next = acquired[0].next_fire_time().unwrap();
    assert!(next > Utc::now() - Duration::seconds(5));
}

#[tokio::test]
async fn test_paused_group_applies_to_triggers_added_later() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let paused = store
        .pause_triggers(&GroupMatcher::equals("triggers"))
        .await
        .unwrap();
    assert_eq!(paused, vec!["triggers".to_string()]);

    let job = job("later");
    let trigger = once_trigger("added", &job, soon(), 5);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Paused
    );

    let resumed = store
        .resume_triggers(&GroupMatcher::equals("triggers"))
        .await
        .unwrap();
    assert_eq!(resumed, vec!["triggers".to_string()]);
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Normal
    );
}

#[tokio::test]
async fn test_restart_recovers_jobs_requesting_recovery() {
    let dir = TempDir::new().unwrap();
    let config = store_config(&dir);
    let base = soon();

    let recoverable = JobDetail::builder("noop")
        .with_identity("recoverable", "jobs")
        .requests_recovery(true)
        .build();
    let plain = job("plain");
    {
        let store = open_store(&config, "node-1").await;
        store
            .store_job_and_trigger(&recoverable, &repeating_trigger("r", &recoverable, base))
            .await
            .unwrap();
        store
            .store_job_and_trigger(&plain, &repeating_trigger("p", &plain, base))
            .await
            .unwrap();
        let acquired = store
            .acquire_next_triggers(base + Duration::seconds(1), 2, Duration::zero())
            .await
            .unwrap();
        assert_eq!(acquired.len(), 2);
        store.triggers_fired(&acquired).await.unwrap();
        // 模拟执行中途崩溃：不调用完成回调
        store.shutdown().await.unwrap();
    }

    let store = open_store(&config, "node-1").await;
    store.scheduler_started().await.unwrap();

    let recovery_keys = store
        .get_trigger_keys(&GroupMatcher::equals(RECOVERING_JOBS_GROUP))
        .await
        .unwrap();
    assert_eq!(recovery_keys.len(), 1);
    let recovery = store
        .retrieve_trigger(recovery_keys.iter().next().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovery.job_key, recoverable.key);
    assert_eq!(
        recovery.data_map.get_str(FAILED_JOB_ORIGINAL_TRIGGER_NAME),
        Some("r")
    );
    assert!(store.get_fired_trigger_records().await.unwrap().is_empty());
    store.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cluster_member_takes_over_failed_instance() {
    let dir = TempDir::new().unwrap();
    let config = JobStoreSection {
        is_clustered: true,
        cluster_checkin_interval_ms: 200,
        ..store_config(&dir)
    };
    let base = soon();
    let job = JobDetail::builder("noop")
        .with_identity("shared", "jobs")
        .requests_recovery(true)
        .build();

    let failed = open_store(&config, "node-a").await;
    failed
        .store_job_and_trigger(&job, &repeating_trigger("shared", &job, base))
        .await
        .unwrap();
    fire_one(&failed, base + Duration::seconds(1)).await;
    failed.shutdown().await.unwrap();

    // node-a 从未签到，node-b 首次签到时接管其遗留的触发记录
    let survivor = open_store(&config, "node-b").await;
    survivor.scheduler_started().await.unwrap();

    let recovery_keys = survivor
        .get_trigger_keys(&GroupMatcher::equals(RECOVERING_JOBS_GROUP))
        .await
        .unwrap();
    assert_eq!(recovery_keys.len(), 1);
    assert!(recovery_keys
        .iter()
        .next()
        .unwrap()
        .name()
        .starts_with("recover_node-a_"));
    assert!(survivor.get_fired_trigger_records().await.unwrap().is_empty());
    survivor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_released_skip_after_pause_leaves_no_fired_record() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let job = job("paused-mid-flight");
    let trigger = once_trigger("pmf", &job, soon(), 5);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let acquired = store
        .acquire_next_triggers(soon() + Duration::seconds(5), 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    store.pause_trigger(&trigger.key).await.unwrap();

    let results = store.triggers_fired(&acquired).await.unwrap();
    assert!(matches!(results[0], TriggerFiredResult::Skipped));
    store.release_acquired_trigger(&acquired[0]).await.unwrap();
    assert!(store.get_fired_trigger_records().await.unwrap().is_empty());

    store.resume_trigger(&trigger.key).await.unwrap();
    let reacquired = store
        .acquire_next_triggers(soon() + Duration::seconds(5), 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(reacquired.len(), 1);
}

#[tokio::test]
async fn test_missing_calendar_at_fire_time_moves_trigger_to_error() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let job = job("no-calendar");
    let mut trigger = once_trigger("nc", &job, soon(), 5);
    trigger.calendar_name = Some("nope".to_string());
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let acquired = store
        .acquire_next_triggers(soon() + Duration::seconds(5), 1, Duration::zero())
        .await
        .unwrap();
    let results = store.triggers_fired(&acquired).await.unwrap();
    assert!(matches!(
        results[0],
        TriggerFiredResult::Failed(SchedulerError::CalendarNotFound(_))
    ));
    store.release_acquired_trigger(&acquired[0]).await.unwrap();

    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Error
    );
    assert!(store.get_fired_trigger_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreadable_job_row_moves_trigger_to_error() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let broken = job("broken");
    let healthy = job("healthy");
    let broken_trigger = once_trigger("broken", &broken, soon(), 5);
    store
        .store_job_and_trigger(&broken, &broken_trigger)
        .await
        .unwrap();
    store
        .store_job_and_trigger(&healthy, &once_trigger("healthy", &healthy, soon(), 1))
        .await
        .unwrap();

    let acquired = store
        .acquire_next_triggers(soon() + Duration::seconds(5), 2, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 2);
    sqlx::query("UPDATE job_details SET job_data = '{not json' WHERE job_name = 'broken'")
        .execute(store.pool())
        .await
        .unwrap();

    let results = store.triggers_fired(&acquired).await.unwrap();
    let by_name: Vec<(&str, bool)> = acquired
        .iter()
        .zip(&results)
        .map(|(t, r)| (t.key.name(), matches!(r, TriggerFiredResult::Failed(_))))
        .collect();
    assert!(by_name.contains(&("broken", true)));
    assert!(by_name.contains(&("healthy", false)));
    assert_eq!(
        store.get_trigger_state(&broken_trigger.key).await.unwrap(),
        TriggerState::Error
    );
    let records = store.get_fired_trigger_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].trigger_key.name(), "healthy");
}

#[tokio::test]
async fn test_unreadable_job_row_does_not_block_acquisition() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let broken = job("broken");
    let healthy = job("healthy");
    let broken_trigger = once_trigger("broken", &broken, soon(), 5);
    store
        .store_job_and_trigger(&broken, &broken_trigger)
        .await
        .unwrap();
    store
        .store_job_and_trigger(&healthy, &once_trigger("healthy", &healthy, soon(), 1))
        .await
        .unwrap();
    sqlx::query("UPDATE job_details SET job_data = '{not json' WHERE job_name = 'broken'")
        .execute(store.pool())
        .await
        .unwrap();

    let acquired = store
        .acquire_next_triggers(soon() + Duration::seconds(5), 2, Duration::zero())
        .await
        .unwrap();
    let names: Vec<&str> = acquired.iter().map(|t| t.key.name()).collect();
    assert_eq!(names, vec!["healthy"]);
    assert_eq!(
        store.get_trigger_state(&broken_trigger.key).await.unwrap(),
        TriggerState::Error
    );
}

#[tokio::test]
async fn test_unreadable_schedule_moves_trigger_to_error() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let shared = job("shared");
    let broken_trigger = once_trigger("broken", &shared, soon(), 5);
    let healthy_trigger = once_trigger("healthy", &shared, soon(), 1);
    store
        .store_job_and_trigger(&shared, &broken_trigger)
        .await
        .unwrap();
    store.store_trigger(&healthy_trigger, false).await.unwrap();
    sqlx::query("UPDATE triggers SET schedule_data = '[1, 2' WHERE trigger_name = 'broken'")
        .execute(store.pool())
        .await
        .unwrap();

    let acquired = store
        .acquire_next_triggers(soon() + Duration::seconds(5), 2, Duration::zero())
        .await
        .unwrap();
    let names: Vec<&str> = acquired.iter().map(|t| t.key.name()).collect();
    assert_eq!(names, vec!["healthy"]);
    assert_eq!(
        store.get_trigger_state(&broken_trigger.key).await.unwrap(),
        TriggerState::Error
    );
    let results = store.triggers_fired(&acquired).await.unwrap();
    assert!(matches!(results[0], TriggerFiredResult::Fired(_)));
}

#[tokio::test]
async fn test_late_release_keeps_executing_record() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_config(&dir), "node-1").await;
    let job = job("executing");
    store
        .store_job_and_trigger(&job, &repeating_trigger("exec", &job, soon()))
        .await
        .unwrap();

    let acquired = store
        .acquire_next_triggers(soon() + Duration::seconds(5), 1, Duration::zero())
        .await
        .unwrap();
    store.triggers_fired(&acquired).await.unwrap();
    store.release_acquired_trigger(&acquired[0]).await.unwrap();

    let records = store.get_fired_trigger_records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, FiredTriggerState::Executing);
}
