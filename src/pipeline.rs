//! Report execution pipeline: retrieve, then project.
//!
//! Shared by the HTTP layer, the CLI, and the scheduler's report
//! generation handler. Holds no per-run state, so one pipeline serves any
//! number of concurrent executions.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, FilesConfig};
use crate::connection::ConnectionManager;
use crate::db;
use crate::error::{ReportError, Result};
use crate::models::{DataSource, ProjectionSpec, Report, RetrievalSpec, TabularResult};
use crate::projection::project;
use crate::retrieve::Retriever;
use crate::store::{SqliteStore, Store};

pub struct ReportPipeline {
    store: Arc<dyn Store>,
    retriever: Retriever,
}

impl ReportPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        connections: Arc<ConnectionManager>,
        files: FilesConfig,
    ) -> Self {
        Self {
            store,
            retriever: Retriever::new(connections, files),
        }
    }

    /// Pipeline over the configured SQLite store with the built-in engines.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        Ok(Self::new(
            Arc::new(SqliteStore::new(pool)),
            Arc::new(ConnectionManager::with_builtins(config.pool.clone())),
            config.files.clone(),
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.retriever.connections()
    }

    /// Run retrieval and projection against an already-loaded source.
    pub async fn execute(
        &self,
        source: &DataSource,
        retrieval: &RetrievalSpec,
        projection: &ProjectionSpec,
    ) -> Result<TabularResult> {
        let started = Instant::now();
        let raw = self.retriever.retrieve(source, retrieval).await?;
        let shaped = project(&raw, projection);
        tracing::info!(
            source_id = %source.id,
            kind = %source.kind,
            raw_rows = raw.total_row_count,
            rows = shaped.rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "report executed"
        );
        Ok(shaped)
    }

    /// Ad-hoc execution against the source named by `retrieval.source_id`.
    pub async fn run_adhoc(
        &self,
        retrieval: &RetrievalSpec,
        projection: &ProjectionSpec,
    ) -> Result<TabularResult> {
        let source = self.load_source(&retrieval.source_id).await?;
        self.execute(&source, retrieval, projection).await
    }

    /// Execute a saved report by id.
    pub async fn run_report(&self, report_id: &str) -> Result<TabularResult> {
        let report = self.load_report(report_id).await?;
        self.run_loaded(&report).await
    }

    pub async fn run_loaded(&self, report: &Report) -> Result<TabularResult> {
        let source = self.load_source(&report.data_source_id).await?;
        self.execute(&source, &report.retrieval, &report.projection)
            .await
    }

    pub async fn load_report(&self, report_id: &str) -> Result<Report> {
        self.store
            .get_report(report_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| ReportError::ReportNotFound(report_id.to_string()))
    }

    pub async fn load_source(&self, source_id: &str) -> Result<DataSource> {
        self.store
            .get_data_source(source_id)
            .await
            .map_err(store_error)?
            .ok_or_else(|| ReportError::SourceNotFound(source_id.to_string()))
    }
}

fn store_error(err: anyhow::Error) -> ReportError {
    ReportError::Store(format!("{:#}", err))
}
