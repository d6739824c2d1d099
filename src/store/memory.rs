//! In-memory [`Store`] implementation for tests and embedders.
//!
//! Uses ordered maps behind `parking_lot::RwLock` so listings come back
//! in id order, matching the SQLite backend.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::{DataSource, Report, ReportRun, ScheduledTask};

use super::{stamp_source, Store};

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    sources: RwLock<BTreeMap<String, DataSource>>,
    reports: RwLock<BTreeMap<String, Report>>,
    tasks: RwLock<BTreeMap<String, ScheduledTask>>,
    runs: RwLock<Vec<ReportRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_data_source(&self, id: &str) -> Result<Option<DataSource>> {
        Ok(self.sources.read().get(id).cloned())
    }

    async fn list_data_sources(&self) -> Result<Vec<DataSource>> {
        Ok(self.sources.read().values().cloned().collect())
    }

    async fn save_data_source(&self, source: &DataSource) -> Result<DataSource> {
        let mut sources = self.sources.write();
        let stored = stamp_source(source, sources.get(&source.id));
        sources.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_report(&self, id: &str) -> Result<Option<Report>> {
        Ok(self.reports.read().get(id).cloned())
    }

    async fn list_reports(&self) -> Result<Vec<Report>> {
        Ok(self.reports.read().values().cloned().collect())
    }

    async fn save_report(&self, report: &Report) -> Result<()> {
        self.reports
            .write()
            .insert(report.id.clone(), report.clone());
        Ok(())
    }

    async fn list_tasks(&self, active_only: bool) -> Result<Vec<ScheduledTask>> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| !active_only || t.is_active)
            .cloned()
            .collect())
    }

    async fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        self.tasks.write().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        Ok(self.tasks.write().remove(id).is_some())
    }

    async fn record_report_run(&self, run: &ReportRun) -> Result<()> {
        self.runs.write().push(run.clone());
        Ok(())
    }

    async fn list_report_runs(&self, report_id: &str, limit: i64) -> Result<Vec<ReportRun>> {
        let runs = self.runs.read();
        let mut matching: Vec<ReportRun> = runs
            .iter()
            .filter(|r| r.report_id == report_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionDescriptor, SourceKind, TaskType};

    fn task(id: &str, active: bool) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            name: id.to_string(),
            cron_expression: "* * * * *".to_string(),
            task_type: TaskType::TestTask,
            target_id: None,
            is_active: active,
        }
    }

    #[tokio::test]
    async fn test_list_tasks_filters_inactive() {
        let store = MemoryStore::new();
        store.save_task(&task("b", true)).await.unwrap();
        store.save_task(&task("a", true)).await.unwrap();
        store.save_task(&task("c", false)).await.unwrap();

        let active: Vec<String> = store
            .list_tasks(true)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(active, vec!["a", "b"]);
        assert_eq!(store.list_tasks(false).await.unwrap().len(), 3);

        assert!(store.delete_task("a").await.unwrap());
        assert!(!store.delete_task("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_resave_changes_cache_key() {
        let store = MemoryStore::new();
        let source = DataSource {
            id: "ds1".to_string(),
            name: "Sales".to_string(),
            kind: SourceKind::FlatFile,
            descriptor: ConnectionDescriptor::None,
            status: "active".to_string(),
            created_at: 0,
            updated_at: None,
        };
        let first = store.save_data_source(&source).await.unwrap();
        let second = store.save_data_source(&first).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_ne!(first.cache_key(), second.cache_key());
    }
}
