use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every catalog table. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Data sources; descriptor is the tagged JSON form of ConnectionDescriptor
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS data_sources (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            descriptor_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            created_at INTEGER NOT NULL,
            updated_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reports (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            data_source_id TEXT NOT NULL,
            retrieval_json TEXT NOT NULL DEFAULT '{}',
            projection_json TEXT NOT NULL DEFAULT '{}',
            chart_type TEXT,
            FOREIGN KEY (data_source_id) REFERENCES data_sources(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            cron_expression TEXT NOT NULL,
            task_type TEXT NOT NULL,
            target_id TEXT,
            is_active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS report_runs (
            id TEXT PRIMARY KEY,
            report_id TEXT NOT NULL,
            task_id TEXT,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            row_count INTEGER,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_active ON scheduled_tasks(is_active)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_report_runs_report ON report_runs(report_id, started_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
