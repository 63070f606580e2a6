//! 崩溃恢复的公共逻辑
//!
//! 为请求恢复的作业生成一次性恢复触发器：放在 `RECOVERING_JOBS` 分组，
//! 忽略错过触发策略，从原计划触发时间开始，数据中记录原触发器与原触发时间。

use scheduler_core::{
    FiredTriggerRecord, JobDataMap, MisfireInstruction, SimpleSchedule, Trigger,
    FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME, FAILED_JOB_ORIGINAL_TRIGGER_GROUP,
    FAILED_JOB_ORIGINAL_TRIGGER_NAME, FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME,
    RECOVERING_JOBS_GROUP,
};

use crate::observability::StructuredLogger;

/// 根据遗留的触发记录构造恢复触发器
pub fn recovery_trigger(
    record: &FiredTriggerRecord,
    original_data: Option<&JobDataMap>,
    sequence: u64,
) -> Trigger {
    let mut data = original_data.cloned().unwrap_or_default();
    data.put(FAILED_JOB_ORIGINAL_TRIGGER_NAME, record.trigger_key.name());
    data.put(FAILED_JOB_ORIGINAL_TRIGGER_GROUP, record.trigger_key.group());
    data.put(
        FAILED_JOB_ORIGINAL_TRIGGER_FIRETIME,
        record.fired_time.timestamp_millis(),
    );
    data.put(
        FAILED_JOB_ORIGINAL_TRIGGER_SCHEDULED_FIRETIME,
        record.scheduled_time.timestamp_millis(),
    );

    let mut trigger = Trigger::builder()
        .with_identity(
            format!("recover_{}_{}", record.instance_id, sequence),
            RECOVERING_JOBS_GROUP,
        )
        .for_job(record.job_key.clone())
        .start_at(record.scheduled_time)
        .with_priority(record.priority)
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy)
        .with_schedule(SimpleSchedule::once())
        .build();
    trigger.data_map = data;
    trigger.compute_first_fire_time(None);

    StructuredLogger::log_trigger_recovered(
        &record.trigger_key,
        &record.job_key,
        &trigger.key,
        &record.instance_id,
    );
    trigger
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use scheduler_core::{FiredTriggerState, JobKey, TriggerKey};

    #[test]
    fn test_recovery_trigger_carries_original_identity() {
        let scheduled = Utc.with_ymd_and_hms(2030, 1, 1, 8, 0, 0).unwrap();
        let record = FiredTriggerRecord {
            fire_instance_id: "node-a17".to_string(),
            trigger_key: TriggerKey::new("nightly", "reports"),
            job_key: JobKey::new("export", "reports"),
            instance_id: "node-a".to_string(),
            fired_time: scheduled,
            scheduled_time: scheduled,
            priority: 7,
            state: FiredTriggerState::Executing,
            concurrent_execution_disallowed: false,
            requests_recovery: true,
        };
        let mut original = JobDataMap::new();
        original.put("region", "eu");

        let trigger = recovery_trigger(&record, Some(&original), 3);
        assert_eq!(trigger.key.group(), RECOVERING_JOBS_GROUP);
        assert_eq!(trigger.key.name(), "recover_node-a_3");
        assert!(trigger.is_recovering());
        assert_eq!(trigger.priority, 7);
        assert_eq!(trigger.next_fire_time(), Some(scheduled));
        assert_eq!(
            trigger.misfire_instruction,
            MisfireInstruction::IgnoreMisfirePolicy
        );
        assert_eq!(
            trigger.data_map.get_str(FAILED_JOB_ORIGINAL_TRIGGER_NAME),
            Some("nightly")
        );
        assert_eq!(trigger.data_map.get_str("region"), Some("eu"));
    }
}
