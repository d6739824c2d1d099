//! Persistence collaborator for the report core.
//!
//! The [`Store`] trait is everything the connection manager, the report
//! pipeline, and the scheduler need from persistent storage. Two backends
//! ship with the crate: [`SqliteStore`] for the `rpt` binary and
//! [`MemoryStore`] for tests and embedders.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`get_data_source`](Store::get_data_source) | Load one source by id |
//! | [`save_data_source`](Store::save_data_source) | Insert or update a source, bumping `updated_at` |
//! | [`list_tasks`](Store::list_tasks) | Read schedules, optionally only active ones |
//! | [`record_report_run`](Store::record_report_run) | Store a scheduled report outcome |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DataSource, Report, ReportRun, ScheduledTask};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>>;

    async fn list_data_sources(&self) -> Result<Vec<DataSource>>;

    /// Insert or update a data source.
    ///
    /// Updates always move `updated_at` strictly forward, so the connection
    /// cache key of an edited source never matches its previous key.
    /// Returns the row as stored.
    async fn save_data_source(&self, source: &DataSource) -> Result<DataSource>;

    async fn get_report(&self, id: &str) -> Result<Option<Report>>;

    async fn list_reports(&self) -> Result<Vec<Report>>;

    async fn save_report(&self, report: &Report) -> Result<()>;

    /// Read schedules ordered by id. `active_only` filters on `is_active`.
    async fn list_tasks(&self, active_only: bool) -> Result<Vec<ScheduledTask>>;

    async fn save_task(&self, task: &ScheduledTask) -> Result<()>;

    /// Returns `true` when a row was removed.
    async fn delete_task(&self, id: &str) -> Result<bool>;

    async fn record_report_run(&self, run: &ReportRun) -> Result<()>;

    /// Most recent runs first.
    async fn list_report_runs(&self, report_id: &str, limit: i64) -> Result<Vec<ReportRun>>;
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Next `updated_at` for an edited row: now, but never at or before `previous`.
pub(crate) fn bump_modified(previous: i64) -> i64 {
    now_millis().max(previous + 1)
}

/// Fills in timestamps for a source being written.
pub(crate) fn stamp_source(incoming: &DataSource, existing: Option<&DataSource>) -> DataSource {
    let mut stored = incoming.clone();
    match existing {
        Some(prev) => {
            stored.created_at = prev.created_at;
            stored.updated_at = Some(bump_modified(prev.last_modified()));
        }
        None => {
            if stored.created_at == 0 {
                stored.created_at = now_millis();
            }
            stored.updated_at = None;
        }
    }
    stored
}
