//! SQLite-backed [`Store`] implementation.
//!
//! Structured fields (descriptor, retrieval, projection) are stored as JSON
//! text and decoded into their typed forms on every read, so a malformed
//! row fails loudly here instead of deep inside an adapter.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{DataSource, Report, ReportRun, RunStatus, ScheduledTask};

use super::{stamp_source, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn source_from_row(row: &SqliteRow) -> Result<DataSource> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let descriptor_json: String = row.try_get("descriptor_json")?;
    let descriptor = serde_json::from_str(&descriptor_json)
        .with_context(|| format!("Invalid descriptor for data source {}", id))?;

    Ok(DataSource {
        name: row.try_get("name")?,
        kind: kind.into(),
        descriptor,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        id,
    })
}

fn report_from_row(row: &SqliteRow) -> Result<Report> {
    let id: String = row.try_get("id")?;
    let retrieval_json: String = row.try_get("retrieval_json")?;
    let projection_json: String = row.try_get("projection_json")?;

    Ok(Report {
        name: row.try_get("name")?,
        data_source_id: row.try_get("data_source_id")?,
        retrieval: serde_json::from_str(&retrieval_json)
            .with_context(|| format!("Invalid retrieval spec for report {}", id))?,
        projection: serde_json::from_str(&projection_json)
            .with_context(|| format!("Invalid projection spec for report {}", id))?,
        chart_type: row.try_get("chart_type")?,
        id,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<ScheduledTask> {
    let task_type: String = row.try_get("task_type")?;
    let is_active: i64 = row.try_get("is_active")?;
    Ok(ScheduledTask {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        cron_expression: row.try_get("cron_expression")?,
        task_type: task_type.into(),
        target_id: row.try_get("target_id")?,
        is_active: is_active != 0,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<ReportRun> {
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "succeeded" => RunStatus::Succeeded,
        _ => RunStatus::Failed,
    };
    Ok(ReportRun {
        id: row.try_get("id")?,
        report_id: row.try_get("report_id")?,
        task_id: row.try_get("task_id")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        status,
        row_count: row.try_get("row_count")?,
        error: row.try_get("error")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>> {
        let row = sqlx::query("SELECT * FROM data_sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        let rows = sqlx::query("SELECT * FROM data_sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn save_data_source(&self, source: &DataSource) -> Result<DataSource> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query("SELECT * FROM data_sources WHERE id = ?")
            .bind(&source.id)
            .fetch_optional(&mut *tx)
            .await?;
        let existing = existing.as_ref().map(source_from_row).transpose()?;
        let stored = stamp_source(source, existing.as_ref());
        let descriptor_json = serde_json::to_string(&stored.descriptor)?;

        sqlx::query(
            r#"
            INSERT INTO data_sources (id, name, kind, descriptor_json, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                descriptor_json = excluded.descriptor_json,
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&stored.id)
        .bind(&stored.name)
        .bind(stored.kind.as_str())
        .bind(&descriptor_json)
        .bind(&stored.status)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn get_report(&self, id: &str) -> Result<Option<Report>> {
        let row = sqlx::query("SELECT * FROM reports WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(report_from_row).transpose()
    }

    async fn list_reports(&self) -> Result<Vec<Report>> {
        let rows = sqlx::query("SELECT * FROM reports ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(report_from_row).collect()
    }

    async fn save_report(&self, report: &Report) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reports (id, name, data_source_id, retrieval_json, projection_json, chart_type)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                data_source_id = excluded.data_source_id,
                retrieval_json = excluded.retrieval_json,
                projection_json = excluded.projection_json,
                chart_type = excluded.chart_type
            "#,
        )
        .bind(&report.id)
        .bind(&report.name)
        .bind(&report.data_source_id)
        .bind(serde_json::to_string(&report.retrieval)?)
        .bind(serde_json::to_string(&report.projection)?)
        .bind(&report.chart_type)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_tasks(&self, active_only: bool) -> Result<Vec<ScheduledTask>> {
        let sql = if active_only {
            "SELECT * FROM scheduled_tasks WHERE is_active = 1 ORDER BY id"
        } else {
            "SELECT * FROM scheduled_tasks ORDER BY id"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_tasks (id, name, cron_expression, task_type, target_id, is_active)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                cron_expression = excluded.cron_expression,
                task_type = excluded.task_type,
                target_id = excluded.target_id,
                is_active = excluded.is_active
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.cron_expression)
        .bind(task.task_type.as_str())
        .bind(&task.target_id)
        .bind(task.is_active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_report_run(&self, run: &ReportRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO report_runs (id, report_id, task_id, started_at, finished_at, status, row_count, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.report_id)
        .bind(&run.task_id)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.as_str())
        .bind(run.row_count)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_report_runs(&self, report_id: &str, limit: i64) -> Result<Vec<ReportRun>> {
        let rows = sqlx::query(
            "SELECT * FROM report_runs WHERE report_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(report_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}
