//! TOML catalog of sources, reports, and schedules.
//!
//! `rpt load <catalog.toml>` upserts every entry into the store. A catalog
//! looks like:
//!
//! ```toml
//! [[sources]]
//! id = "sales"
//! name = "Sales export"
//! kind = "flat-file"
//! descriptor = { type = "file", path = "sales.csv" }
//!
//! [[reports]]
//! id = "sales-by-region"
//! name = "Sales by region"
//! data_source_id = "sales"
//! projection = { selected_columns = ["region", "sales"], aggregates = { sales = "SUM" } }
//!
//! [[schedules]]
//! id = "nightly-sales"
//! name = "Nightly sales"
//! cron_expression = "0 2 * * *"
//! task_type = "REPORT_GENERATION"
//! target_id = "sales-by-region"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::config::Config;
use crate::cron::CronExpression;
use crate::db;
use crate::models::{DataSource, Report, ScheduledTask};
use crate::store::{SqliteStore, Store};

#[derive(Debug, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub sources: Vec<DataSource>,
    #[serde(default)]
    pub reports: Vec<Report>,
    #[serde(default)]
    pub schedules: Vec<ScheduledTask>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub sources: usize,
    pub reports: usize,
    pub schedules: usize,
    /// Schedules stored despite an unparseable cron expression.
    pub invalid_schedules: usize,
}

pub fn parse_catalog(text: &str) -> Result<Catalog> {
    let catalog: Catalog = toml::from_str(text).context("Failed to parse catalog")?;
    catalog.validate()?;
    Ok(catalog)
}

pub fn load_catalog(path: &Path) -> Result<Catalog> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog: {}", path.display()))?;
    parse_catalog(&text).with_context(|| format!("Invalid catalog: {}", path.display()))
}

impl Catalog {
    /// Reject duplicate ids within each section.
    pub fn validate(&self) -> Result<()> {
        check_unique("source", self.sources.iter().map(|s| s.id.as_str()))?;
        check_unique("report", self.reports.iter().map(|r| r.id.as_str()))?;
        check_unique("schedule", self.schedules.iter().map(|t| t.id.as_str()))?;
        Ok(())
    }
}

fn check_unique<'a>(what: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            bail!("{} with empty id", what);
        }
        if !seen.insert(id) {
            bail!("duplicate {} id '{}'", what, id);
        }
    }
    Ok(())
}

/// Upsert every catalog entry. Reports are stored after sources so a
/// report may reference a source defined in the same catalog.
pub async fn apply_catalog(store: &dyn Store, catalog: &Catalog) -> Result<LoadSummary> {
    let mut summary = LoadSummary::default();

    for source in &catalog.sources {
        store
            .save_data_source(source)
            .await
            .with_context(|| format!("Failed to save source {}", source.id))?;
        summary.sources += 1;
    }

    for report in &catalog.reports {
        if store.get_data_source(&report.data_source_id).await?.is_none() {
            bail!(
                "report {} references unknown source {}",
                report.id,
                report.data_source_id
            );
        }
        store
            .save_report(report)
            .await
            .with_context(|| format!("Failed to save report {}", report.id))?;
        summary.reports += 1;
    }

    for task in &catalog.schedules {
        if let Err(e) = CronExpression::parse(&task.cron_expression) {
            tracing::warn!(task_id = %task.id, error = %e, "schedule stored with invalid cron expression");
            summary.invalid_schedules += 1;
        }
        store
            .save_task(task)
            .await
            .with_context(|| format!("Failed to save schedule {}", task.id))?;
        summary.schedules += 1;
    }

    Ok(summary)
}

pub async fn run_load(config: &Config, path: &Path) -> Result<()> {
    let catalog = load_catalog(path)?;
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let summary = apply_catalog(&store, &catalog).await?;

    println!("Loaded catalog {}", path.display());
    println!("  sources:   {}", summary.sources);
    println!("  reports:   {}", summary.reports);
    println!("  schedules: {}", summary.schedules);
    if summary.invalid_schedules > 0 {
        println!(
            "  warning: {} schedule(s) have invalid cron expressions and will not run",
            summary.invalid_schedules
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregateOp, ConnectionDescriptor, SourceKind, TaskType};
    use crate::store::MemoryStore;

    const CATALOG: &str = r#"
[[sources]]
id = "sales"
name = "Sales export"
kind = "flat-file"
descriptor = { type = "file", path = "sales.csv", delimiter = ";" }

[[sources]]
id = "warehouse"
name = "Warehouse"
kind = "relational-query"

[sources.descriptor]
type = "relational"
engine = "postgres"
host = "db.internal"
port = 5432
user = "reporter"
database = "dw"

[[reports]]
id = "by-region"
name = "Sales by region"
data_source_id = "sales"
chart_type = "bar"

[reports.projection]
selected_columns = ["region", "sales"]
group_by = "region"
aggregates = { sales = "SUM" }

[[schedules]]
id = "nightly"
name = "Nightly"
cron_expression = "0 2 * * *"
task_type = "REPORT_GENERATION"
target_id = "by-region"

[[schedules]]
id = "broken"
name = "Broken"
cron_expression = "not-a-cron"
task_type = "TEST_TASK"
is_active = false
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = parse_catalog(CATALOG).unwrap();
        assert_eq!(catalog.sources.len(), 2);
        assert_eq!(catalog.sources[1].kind, SourceKind::RelationalQuery);
        match &catalog.sources[0].descriptor {
            ConnectionDescriptor::File(file) => assert_eq!(file.delimiter, ';'),
            other => panic!("expected file descriptor, got {:?}", other),
        }
        match &catalog.sources[1].descriptor {
            ConnectionDescriptor::Relational(rel) => {
                assert_eq!(rel.port, 5432);
                assert!(rel.password.is_empty());
            }
            other => panic!("expected relational descriptor, got {:?}", other),
        }
        assert_eq!(
            catalog.reports[0].projection.aggregates.get("sales"),
            Some(&AggregateOp::Sum)
        );
        assert_eq!(catalog.schedules[0].task_type, TaskType::ReportGeneration);
        assert!(catalog.schedules[0].is_active);
        assert!(!catalog.schedules[1].is_active);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let text = r#"
[[schedules]]
id = "a"
name = "a"
cron_expression = "* * * * *"
task_type = "TEST_TASK"

[[schedules]]
id = "a"
name = "again"
cron_expression = "* * * * *"
task_type = "TEST_TASK"
"#;
        let err = parse_catalog(text).unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate schedule id 'a'"));
    }

    #[tokio::test]
    async fn test_apply_catalog() {
        let store = MemoryStore::new();
        let catalog = parse_catalog(CATALOG).unwrap();
        let summary = apply_catalog(&store, &catalog).await.unwrap();
        assert_eq!(
            summary,
            LoadSummary {
                sources: 2,
                reports: 1,
                schedules: 2,
                invalid_schedules: 1,
            }
        );
        assert!(store.get_report("by-region").await.unwrap().is_some());
        assert_eq!(store.list_tasks(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_report_with_unknown_source_fails() {
        let store = MemoryStore::new();
        let text = r#"
[[reports]]
id = "orphan"
name = "Orphan"
data_source_id = "nowhere"
"#;
        let catalog = parse_catalog(text).unwrap();
        assert!(apply_catalog(&store, &catalog).await.is_err());
    }
}
