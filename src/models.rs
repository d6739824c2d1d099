//! Core data models used throughout Report Harness.
//!
//! These types describe where report data comes from ([`DataSource`]), what
//! a single execution should fetch ([`RetrievalSpec`]) and how it is shaped
//! ([`ProjectionSpec`]), the canonical tabular contract every adapter
//! produces ([`TabularResult`]), and the persisted job definitions the
//! scheduler mirrors ([`ScheduledTask`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// One row of a [`TabularResult`], keyed by column name in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

// ═══════════════════════════════════════════════════════════════════════
// Data sources
// ═══════════════════════════════════════════════════════════════════════

/// The kind of a data source, which selects the retrieval adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceKind {
    RelationalTable,
    RelationalQuery,
    RelationalProcedure,
    Spreadsheet,
    FlatFile,
    /// Any kind without a real adapter. Retrieval returns a placeholder.
    Other(String),
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            SourceKind::RelationalTable => "relational-table",
            SourceKind::RelationalQuery => "relational-query",
            SourceKind::RelationalProcedure => "relational-procedure",
            SourceKind::Spreadsheet => "spreadsheet",
            SourceKind::FlatFile => "flat-file",
            SourceKind::Other(other) => other,
        }
    }

    pub fn is_relational(&self) -> bool {
        matches!(
            self,
            SourceKind::RelationalTable
                | SourceKind::RelationalQuery
                | SourceKind::RelationalProcedure
        )
    }
}

impl From<String> for SourceKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "relational-table" => SourceKind::RelationalTable,
            "relational-query" => SourceKind::RelationalQuery,
            "relational-procedure" => SourceKind::RelationalProcedure,
            "spreadsheet" => SourceKind::Spreadsheet,
            "flat-file" => SourceKind::FlatFile,
            _ => SourceKind::Other(s),
        }
    }
}

impl From<SourceKind> for String {
    fn from(kind: SourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// How to reach a data source. Decoded once when the source is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionDescriptor {
    Relational(RelationalDescriptor),
    File(FileDescriptor),
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationalDescriptor {
    /// Engine name resolved through the engine registry (`postgres`, `mysql`).
    pub engine: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    #[serde(default)]
    pub ssl: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Server-side path. Relative paths resolve against `[files].root`.
    pub path: PathBuf,
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_has_header")]
    pub has_header: bool,
}

fn default_delimiter() -> char {
    ','
}

fn default_has_header() -> bool {
    true
}

/// A named, persisted description of where report data comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub descriptor: ConnectionDescriptor,
    #[serde(default = "default_status")]
    pub status: String,
    /// Unix milliseconds.
    #[serde(default)]
    pub created_at: i64,
    /// Unix milliseconds, bumped on every descriptor write.
    #[serde(default)]
    pub updated_at: Option<i64>,
}

fn default_status() -> String {
    "active".to_string()
}

impl DataSource {
    pub fn last_modified(&self) -> i64 {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// Connection cache key: `{id}_{updated_at ?? created_at}`.
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.id, self.last_modified())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Execution parameters
// ═══════════════════════════════════════════════════════════════════════

/// What a single execution should fetch from its source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSpec {
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub sheet_name: Option<String>,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub procedure_name: Option<String>,
}

/// Reduction applied to a measure column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggregateOp {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    None,
}

impl FromStr for AggregateOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUM" => Ok(AggregateOp::Sum),
            "AVG" => Ok(AggregateOp::Avg),
            "COUNT" => Ok(AggregateOp::Count),
            "MIN" => Ok(AggregateOp::Min),
            "MAX" => Ok(AggregateOp::Max),
            "NONE" => Ok(AggregateOp::None),
            other => Err(format!(
                "unknown aggregate '{}'. Use SUM, AVG, COUNT, MIN, MAX, or NONE.",
                other
            )),
        }
    }
}

/// Column selection and single-dimension grouped aggregation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSpec {
    #[serde(default)]
    pub selected_columns: Vec<String>,
    #[serde(default)]
    pub aggregates: BTreeMap<String, AggregateOp>,
    /// Explicit grouping column. Defaults to the first non-measure column.
    #[serde(default)]
    pub group_by: Option<String>,
}

/// The canonical columns + rows contract all adapters produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    /// Row count before projection, aggregation, or limits.
    #[serde(default)]
    pub total_row_count: usize,
    /// Set when the result is sample data standing in for a missing adapter.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub placeholder: bool,
}

impl TabularResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let total_row_count = rows.len();
        Self {
            columns,
            rows,
            total_row_count,
            placeholder: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Reports and schedules
// ═══════════════════════════════════════════════════════════════════════

/// A saved report: a source plus the retrieval and projection to run on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub name: String,
    pub data_source_id: String,
    #[serde(default)]
    pub retrieval: RetrievalSpec,
    #[serde(default)]
    pub projection: ProjectionSpec,
    #[serde(default)]
    pub chart_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    ReportGeneration,
    AlertCheck,
    TestTask,
    Other(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::ReportGeneration => "REPORT_GENERATION",
            TaskType::AlertCheck => "ALERT_CHECK",
            TaskType::TestTask => "TEST_TASK",
            TaskType::Other(other) => other,
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "REPORT_GENERATION" => TaskType::ReportGeneration,
            "ALERT_CHECK" => TaskType::AlertCheck,
            "TEST_TASK" => TaskType::TestTask,
            _ => TaskType::Other(s),
        }
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A persisted cron-triggered job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default = "default_is_active")]
    pub is_active: bool,
}

fn default_is_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

/// The stored outcome of one scheduled report generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRun {
    pub id: String,
    pub report_id: String,
    pub task_id: Option<String>,
    pub started_at: i64,
    pub finished_at: i64,
    pub status: RunStatus,
    pub row_count: Option<i64>,
    pub error: Option<String>,
}
