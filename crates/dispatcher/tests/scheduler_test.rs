
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{
    GroupMatcher, JobDataMap, JobDetail, JobKey, JobStore, Matcher, Scheduler, SchedulerError,
    TriggerKey, TriggerState,
};
use scheduler_dispatcher::{SchedulerBuilder, SchedulerRegistry, MANUAL_TRIGGER_GROUP};
use scheduler_infrastructure::RamJobStore;
use scheduler_test_utils::*;

fn simple_job(name: &str, job_type: &str) -> JobDetail {
    JobDetail::builder(job_type).with_identity(name, "jobs").build()
}

#[tokio::test]
async fn test_repeating_trigger_fires_and_non_durable_job_is_removed() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("repeat"), &tracker).await;
    let listener = RecordingListener::new();
    scheduler.add_scheduler_listener(listener.clone());

    let job = simple_job("count", "counting");
    let trigger = repeating("every-50ms", &job.key, 50, 2);
    scheduler.schedule_job(&job, &trigger).await.unwrap();

    assert!(eventually(5_000, || async { tracker.executions() == 3 }).await);
    let job_key = job.key.clone();
    let s = scheduler.clone();
    assert!(
        eventually(2_000, || {
            let s = s.clone();
            let key = job_key.clone();
            async move { !s.check_job_exists(&key).await.unwrap() }
        })
        .await
    );
    assert!(!scheduler
        .check_trigger_exists(&trigger.key)
        .await
        .unwrap());
    assert!(listener
        .events()
        .contains(&"trigger_finalized:every-50ms".to_string()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tracker.executions(), 3);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_trigger_listener_veto_skips_execution() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("veto"), &tracker).await;
    let vetoer = RecordingListener::vetoing();
    let job_listener = RecordingListener::new();
    scheduler.add_trigger_listener(vetoer.clone(), Vec::new());
    scheduler.add_job_listener(job_listener.clone(), vec![Matcher::Group(
        scheduler_core::StringMatcher::equals("jobs"),
    )]);

    let job = simple_job("vetoed", "counting");
    scheduler
        .schedule_job(&job, &once_at("once", &job.key, 0))
        .await
        .unwrap();

    assert!(eventually(3_000, || async { job_listener.count("job_execution_vetoed") == 1 }).await);
    assert_eq!(tracker.executions(), 0);
    assert_eq!(vetoer.count("trigger_fired"), 1);
    assert_eq!(job_listener.count("job_to_be_executed"), 0);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_refire_immediately_reruns_with_refire_count() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("refire"), &tracker).await;
    let listener = RecordingListener::new();
    scheduler.add_job_listener(listener.clone(), Vec::new());

    let job = simple_job("flaky", "flaky");
    scheduler
        .schedule_job(&job, &once_at("once", &job.key, 0))
        .await
        .unwrap();

    assert!(eventually(3_000, || async { tracker.executions() == 2 }).await);
    assert_eq!(tracker.seen(), vec!["refire-0".to_string(), "refire-1".to_string()]);
    assert!(eventually(1_000, || async { listener.count("job_was_executed") == 1 }).await);
    assert_eq!(listener.count("job_failed"), 1);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_non_concurrent_job_never_overlaps() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("serial"), &tracker).await;

    let job = JobDetail::builder("slow")
        .with_identity("serial", "jobs")
        .using_data("sleep_ms", 80)
        .store_durably(true)
        .disallow_concurrent_execution(true)
        .build();
    scheduler.add_job(&job, false).await.unwrap();
    scheduler
        .schedule_trigger(&repeating("a", &job.key, 40, 2))
        .await
        .unwrap();
    scheduler
        .schedule_trigger(&repeating("b", &job.key, 40, 2))
        .await
        .unwrap();

    assert!(eventually(10_000, || async { tracker.executions() == 6 }).await);
    assert_eq!(tracker.peak(), 1);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_jobs_use_multiple_workers() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("parallel"), &tracker).await;

    for i in 0..3 {
        let job = JobDetail::builder("slow")
            .with_identity(format!("parallel-{i}"), "jobs")
            .using_data("sleep_ms", 300)
            .build();
        scheduler
            .schedule_job(&job, &once_at(&format!("t-{i}"), &job.key, 0))
            .await
            .unwrap();
    }

    assert!(eventually(5_000, || async { tracker.executions() == 3 }).await);
    assert!(tracker.peak() > 1);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_trigger_job_merges_supplied_data() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("manual"), &tracker).await;

    let job = JobDetail::builder("counting")
        .with_identity("manual", "jobs")
        .using_data("who", "job")
        .store_durably(true)
        .build();
    scheduler.add_job(&job, false).await.unwrap();

    let mut data = JobDataMap::new();
    data.put("who", "caller");
    scheduler.trigger_job(&job.key, Some(data)).await.unwrap();
    scheduler.trigger_job(&job.key, None).await.unwrap();

    assert!(eventually(3_000, || async { tracker.executions() == 2 }).await);
    let mut seen = tracker.seen();
    seen.sort();
    assert_eq!(seen, vec!["caller".to_string(), "job".to_string()]);

    // 手动触发器执行完后即被删除，持久作业保留
    let s = scheduler.clone();
    assert!(
        eventually(1_000, || {
            let s = s.clone();
            async move {
                s.get_trigger_keys(&GroupMatcher::equals(MANUAL_TRIGGER_GROUP))
                    .await
                    .unwrap()
                    .is_empty()
            }
        })
        .await
    );
    assert!(scheduler.check_job_exists(&job.key).await.unwrap());
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_paused_job_waits_until_resumed() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("pause"), &tracker).await;

    let job = simple_job("paused", "counting");
    let trigger = once_at("later", &job.key, 200);
    scheduler.schedule_job(&job, &trigger).await.unwrap();
    scheduler.pause_job(&job.key).await.unwrap();
    assert_eq!(
        scheduler.get_trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Paused
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(tracker.executions(), 0);

    scheduler.resume_job(&job.key).await.unwrap();
    assert!(eventually(3_000, || async { tracker.executions() == 1 }).await);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_standby_holds_triggers_until_started() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("standby"), &tracker).await;
    scheduler.standby().await.unwrap();
    assert!(scheduler.is_in_standby_mode());

    let job = simple_job("held", "counting");
    scheduler
        .schedule_job(&job, &once_at("once", &job.key, 0))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(tracker.executions(), 0);

    scheduler.start().await.unwrap();
    assert!(eventually(3_000, || async { tracker.executions() == 1 }).await);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_earlier_trigger_preempts_idle_wait() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("preempt"), &tracker).await;

    let late = simple_job("late", "counting");
    scheduler
        .schedule_job(&late, &once_at("late", &late.key, 800))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let early = JobDetail::builder("counting")
        .with_identity("early", "jobs")
        .using_data("who", "early")
        .build();
    scheduler
        .schedule_job(&early, &once_at("early", &early.key, 50))
        .await
        .unwrap();

    assert!(eventually(400, || async { tracker.seen() == vec!["early".to_string()] }).await);
    assert!(eventually(3_000, || async { tracker.executions() == 2 }).await);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_waits_for_running_job() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("graceful"), &tracker).await;
    let listener = RecordingListener::new();
    scheduler.add_scheduler_listener(listener.clone());

    let job = JobDetail::builder("slow")
        .with_identity("slow", "jobs")
        .using_data("sleep_ms", 300)
        .build();
    scheduler
        .schedule_job(&job, &once_at("once", &job.key, 0))
        .await
        .unwrap();
    assert!(eventually(3_000, || async { tracker.running.load(Ordering::SeqCst) == 1 }).await);

    scheduler.shutdown(true).await.unwrap();
    assert_eq!(tracker.executions(), 1);
    assert!(scheduler.is_shutdown());
    assert_eq!(listener.count("scheduler_shutdown"), 1);

    let other = simple_job("late", "counting");
    let err = scheduler
        .schedule_job(&other, &once_at("late", &other.key, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::SchedulerShutdown));
    // 重复关闭不报错
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_interrupt_running_job() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("interrupt"), &tracker).await;

    let job = simple_job("waiting", "interruptible");
    scheduler
        .schedule_job(&job, &once_at("once", &job.key, 0))
        .await
        .unwrap();

    let s = scheduler.clone();
    assert!(
        eventually(3_000, || {
            let s = s.clone();
            async move { s.currently_executing_jobs().await.len() == 1 }
        })
        .await
    );
    let executing = scheduler.currently_executing_jobs().await;
    assert_eq!(executing[0].job_key, job.key);

    assert!(scheduler.interrupt(&job.key).await.unwrap());
    assert!(eventually(1_000, || async { tracker.interrupted.load(Ordering::SeqCst) == 1 }).await);
    assert!(!scheduler
        .interrupt(&JobKey::new("missing", "jobs"))
        .await
        .unwrap());
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_persisted_job_data_carries_between_runs() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("persist"), &tracker).await;

    let job = JobDetail::builder("counter_data")
        .with_identity("counter", "jobs")
        .store_durably(true)
        .disallow_concurrent_execution(true)
        .persist_data_after_execution(true)
        .build();
    scheduler
        .schedule_job(&job, &repeating("thrice", &job.key, 50, 2))
        .await
        .unwrap();

    assert!(eventually(5_000, || async { tracker.executions() == 3 }).await);
    let s = scheduler.clone();
    let key = job.key.clone();
    assert!(
        eventually(1_000, || {
            let s = s.clone();
            let key = key.clone();
            async move {
                s.get_job_detail(&key)
                    .await
                    .unwrap()
                    .and_then(|job| job.data_map.get_i64("count"))
                    == Some(3)
            }
        })
        .await
    );
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_error_directive_marks_trigger_error() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("error"), &tracker).await;

    let job = JobDetail::builder("failing")
        .with_identity("failing", "jobs")
        .store_durably(true)
        .build();
    scheduler.add_job(&job, false).await.unwrap();
    let trigger = repeating("forever", &job.key, 100, -1);
    scheduler.schedule_trigger(&trigger).await.unwrap();

    let s = scheduler.clone();
    let key = trigger.key.clone();
    assert!(
        eventually(3_000, || {
            let s = s.clone();
            let key = key.clone();
            async move { s.get_trigger_state(&key).await.unwrap() == TriggerState::Error }
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(tracker.executions(), 1);

    scheduler
        .reset_trigger_from_error_state(&trigger.key)
        .await
        .unwrap();
    assert_ne!(
        scheduler.get_trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Error
    );
    scheduler.shutdown(false).await.unwrap();
}

#[tokio::test]
async fn test_trigger_paused_before_firing_is_released() {
    let tracker = Tracker::new();
    let store = PausingStore::new(Arc::new(RamJobStore::new(
        "NON_CLUSTERED",
        chrono::Duration::seconds(60),
    )));
    let scheduler = SchedulerBuilder::new(ram_config("paused-before-fire"))
        .with_job_factory(tracking_factory(&tracker))
        .with_job_store(store.clone())
        .build()
        .await
        .unwrap();
    scheduler.start().await.unwrap();

    let job = simple_job("raced", "counting");
    let trigger = once_at("raced", &job.key, 100);
    scheduler.schedule_job(&job, &trigger).await.unwrap();

    let s = store.clone();
    assert!(
        eventually(3_000, || {
            let s = s.clone();
            async move {
                s.paused() == 1 && s.get_fired_trigger_records().await.unwrap().is_empty()
            }
        })
        .await
    );
    assert_eq!(tracker.executions(), 0);
    assert_eq!(
        scheduler.get_trigger_state(&trigger.key).await.unwrap(),
        TriggerState::Paused
    );

    // 获取记录已清掉，恢复后照常触发
    scheduler.resume_trigger(&trigger.key).await.unwrap();
    assert!(eventually(3_000, || async { tracker.executions() == 1 }).await);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_trigger_with_missing_calendar_moves_to_error() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("missing-calendar"), &tracker).await;
    let listener = RecordingListener::new();
    scheduler.add_scheduler_listener(listener.clone());

    // 绕过调度器的校验直接写入存储，日历在触发时才发现不存在
    let job = simple_job("orphaned", "counting");
    let mut trigger = once_at("orphaned", &job.key, 100);
    trigger.calendar_name = Some("holidays".to_string());
    trigger.compute_first_fire_time(None);
    scheduler
        .job_store()
        .store_job_and_trigger(&job, &trigger)
        .await
        .unwrap();

    let s = scheduler.clone();
    let key = trigger.key.clone();
    assert!(
        eventually(5_000, || {
            let s = s.clone();
            let key = key.clone();
            async move { s.get_trigger_state(&key).await.unwrap() == TriggerState::Error }
        })
        .await
    );
    assert!(eventually(1_000, || async { listener.count("scheduler_error") == 1 }).await);
    assert!(scheduler
        .job_store()
        .get_fired_trigger_records()
        .await
        .unwrap()
        .is_empty());
    assert_eq!(tracker.executions(), 0);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_panicking_job_is_reported_as_failure() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("panic"), &tracker).await;
    let listener = RecordingListener::new();
    scheduler.add_job_listener(listener.clone(), Vec::new());

    let job = simple_job("panics", "panicking");
    scheduler
        .schedule_job(&job, &once_at("once", &job.key, 0))
        .await
        .unwrap();

    assert!(eventually(3_000, || async { listener.count("job_failed") == 1 }).await);
    assert_eq!(tracker.executions(), 1);

    // 工作者在 panic 后依然可用
    let next = simple_job("after-panic", "counting");
    scheduler
        .schedule_job(&next, &once_at("next", &next.key, 0))
        .await
        .unwrap();
    assert!(eventually(3_000, || async { tracker.executions() == 2 }).await);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_misfired_trigger_is_reported_and_fired_now() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("misfire"), &tracker).await;
    scheduler.standby().await.unwrap();
    let listener = RecordingListener::new();
    scheduler.add_trigger_listener(listener.clone(), Vec::new());

    let job = simple_job("late", "counting");
    let trigger = scheduler_core::Trigger::builder()
        .with_identity("late", "triggers")
        .for_job(job.key.clone())
        .start_at(chrono::Utc::now() - chrono::Duration::minutes(5))
        .build();
    scheduler.schedule_job(&job, &trigger).await.unwrap();
    scheduler.start().await.unwrap();

    assert!(eventually(3_000, || async { tracker.executions() == 1 }).await);
    assert_eq!(listener.count("trigger_misfired"), 1);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_registration_errors() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("errors"), &tracker).await;

    let unknown = simple_job("unknown", "does-not-exist");
    let err = scheduler
        .schedule_job(&unknown, &once_at("once", &unknown.key, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::JobFactory(_)));

    let job = simple_job("lonely", "counting");
    let err = scheduler.add_job(&job, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    let other = JobKey::new("other", "jobs");
    let err = scheduler
        .schedule_job(&job, &once_at("mismatch", &other, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Validation(_)));

    let orphan = once_at("orphan", &other, 0);
    assert!(scheduler.schedule_trigger(&orphan).await.is_err());

    let trigger = once_at("dup", &job.key, 60_000);
    scheduler.schedule_job(&job, &trigger).await.unwrap();
    let err = scheduler.schedule_job(&job, &trigger).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists(_)));

    assert!(scheduler.unschedule_job(&trigger.key).await.unwrap());
    assert!(!scheduler
        .unschedule_job(&TriggerKey::new("dup", "triggers"))
        .await
        .unwrap());
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_reschedule_replaces_trigger() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("reschedule"), &tracker).await;

    let job = simple_job("moved", "counting");
    let original = once_at("original", &job.key, 60_000);
    scheduler.schedule_job(&job, &original).await.unwrap();

    let replacement = once_at("replacement", &JobKey::new("ignored", "ignored"), 0);
    let next = scheduler
        .reschedule_job(&original.key, &replacement)
        .await
        .unwrap();
    assert!(next.is_some());
    assert!(!scheduler.check_trigger_exists(&original.key).await.unwrap());

    assert!(eventually(3_000, || async { tracker.executions() == 1 }).await);
    assert!(scheduler
        .reschedule_job(&original.key, &replacement)
        .await
        .unwrap()
        .is_none());
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_metadata_reports_progress() {
    let tracker = Tracker::new();
    let scheduler = started_scheduler(ram_config("meta"), &tracker).await;

    let job = simple_job("once", "counting");
    scheduler
        .schedule_job(&job, &once_at("once", &job.key, 0))
        .await
        .unwrap();
    let s = scheduler.clone();
    assert!(
        eventually(3_000, || {
            let s = s.clone();
            async move { s.metadata().await.unwrap().number_of_jobs_executed == 1 }
        })
        .await
    );

    let metadata = scheduler.metadata().await.unwrap();
    assert_eq!(metadata.scheduler_name, "meta");
    assert!(metadata.started);
    assert!(!metadata.in_standby_mode);
    assert!(metadata.running_since.is_some());
    assert_eq!(metadata.job_store, "RamJobStore");
    assert!(!metadata.job_store_supports_persistence);
    assert_eq!(metadata.thread_pool_size, 4);
    scheduler.shutdown(true).await.unwrap();
}

#[tokio::test]
async fn test_registry_binds_unique_names() {
    let registry = SchedulerRegistry::new();
    let tracker = Tracker::new();
    let first = SchedulerBuilder::new(ram_config("alpha"))
        .with_job_factory(tracking_factory(&tracker))
        .build_into(&registry)
        .await
        .unwrap();
    SchedulerBuilder::new(ram_config("beta"))
        .build_into(&registry)
        .await
        .unwrap();

    let err = SchedulerBuilder::new(ram_config("alpha"))
        .build_into(&registry)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists(_)));

    assert_eq!(registry.names(), vec!["alpha".to_string(), "beta".to_string()]);
    let found = registry.lookup("alpha").unwrap();
    assert!(Arc::ptr_eq(&found, &first));

    registry.shutdown_all(true).await;
    assert!(first.is_shutdown());
    assert!(registry.names().is_empty());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = ram_config("invalid");
    config.scheduler.idle_wait_time_ms = 10;
    let err = SchedulerBuilder::new(config).build().await.unwrap_err();
    assert!(matches!(err, SchedulerError::Configuration(_)));
}
