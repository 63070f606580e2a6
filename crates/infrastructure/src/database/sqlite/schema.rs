use sqlx::SqlitePool;
use tracing::debug;

use scheduler_core::SchedulerResult;

/// 运行数据库迁移
///
/// 所有表都带 `sched_name` 列，多个调度器可以共用同一个数据库文件。
/// 时间列统一存 UTC 毫秒时间戳。
pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
    debug!("Running SQLite job store migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_details (
            sched_name TEXT NOT NULL,
            job_name TEXT NOT NULL,
            job_group TEXT NOT NULL,
            description TEXT,
            job_type TEXT NOT NULL,
            is_durable INTEGER NOT NULL,
            is_nonconcurrent INTEGER NOT NULL,
            is_update_data INTEGER NOT NULL,
            requests_recovery INTEGER NOT NULL,
            job_data TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (sched_name, job_name, job_group)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS triggers (
            sched_name TEXT NOT NULL,
            trigger_name TEXT NOT NULL,
            trigger_group TEXT NOT NULL,
            job_name TEXT NOT NULL,
            job_group TEXT NOT NULL,
            description TEXT,
            next_fire_time INTEGER,
            prev_fire_time INTEGER,
            priority INTEGER NOT NULL,
            trigger_state TEXT NOT NULL,
            schedule_kind TEXT NOT NULL,
            schedule_data TEXT NOT NULL,
            start_time INTEGER NOT NULL,
            end_time INTEGER,
            calendar_name TEXT,
            misfire_instr TEXT NOT NULL,
            job_data TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (sched_name, trigger_name, trigger_group),
            FOREIGN KEY (sched_name, job_name, job_group)
                REFERENCES job_details (sched_name, job_name, job_group)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calendars (
            sched_name TEXT NOT NULL,
            calendar_name TEXT NOT NULL,
            calendar TEXT NOT NULL,
            PRIMARY KEY (sched_name, calendar_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS fired_triggers (
            sched_name TEXT NOT NULL,
            entry_id TEXT NOT NULL,
            trigger_name TEXT NOT NULL,
            trigger_group TEXT NOT NULL,
            job_name TEXT NOT NULL,
            job_group TEXT NOT NULL,
            instance_name TEXT NOT NULL,
            fired_time INTEGER NOT NULL,
            sched_time INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            state TEXT NOT NULL,
            is_nonconcurrent INTEGER NOT NULL,
            requests_recovery INTEGER NOT NULL,
            PRIMARY KEY (sched_name, entry_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // group_kind: TRIGGER 或 JOB
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS paused_groups (
            sched_name TEXT NOT NULL,
            group_kind TEXT NOT NULL,
            group_name TEXT NOT NULL,
            PRIMARY KEY (sched_name, group_kind, group_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduler_state (
            sched_name TEXT NOT NULL,
            instance_name TEXT NOT NULL,
            last_checkin_time INTEGER NOT NULL,
            checkin_interval INTEGER NOT NULL,
            PRIMARY KEY (sched_name, instance_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS locks (
            sched_name TEXT NOT NULL,
            lock_name TEXT NOT NULL,
            PRIMARY KEY (sched_name, lock_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    let indexes = vec![
        "CREATE INDEX IF NOT EXISTS idx_triggers_job ON triggers(sched_name, job_group, job_name)",
        "CREATE INDEX IF NOT EXISTS idx_triggers_state_next ON triggers(sched_name, trigger_state, next_fire_time)",
        "CREATE INDEX IF NOT EXISTS idx_triggers_calendar ON triggers(sched_name, calendar_name)",
        "CREATE INDEX IF NOT EXISTS idx_fired_triggers_instance ON fired_triggers(sched_name, instance_name)",
        "CREATE INDEX IF NOT EXISTS idx_fired_triggers_job ON fired_triggers(sched_name, job_group, job_name)",
    ];

    for index_sql in indexes {
        sqlx::query(index_sql).execute(pool).await?;
    }

    debug!("Successfully completed SQLite job store migrations");
    Ok(())
}
