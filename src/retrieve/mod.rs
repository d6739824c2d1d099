//! Retrieval adapters: source descriptor + retrieval parameters → raw
//! [`TabularResult`].
//!
//! Dispatch is by [`SourceKind`]:
//!
//! | Kind | Adapter |
//! |------|---------|
//! | `spreadsheet` | [`spreadsheet`] (xlsx), or [`delimited`] for `.csv`/`.tsv`/`.txt` files |
//! | `flat-file` | [`delimited`] |
//! | `relational-*` | pooled client from the [`ConnectionManager`] |
//! | anything else | labeled placeholder result |
//!
//! Relational kinds run `query_text` verbatim. No SQL is synthesized from
//! `table_name` or `procedure_name`; a missing query fails with
//! [`ReportError::MissingQueryText`].

pub mod delimited;
pub mod spreadsheet;

use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::FilesConfig;
use crate::connection::ConnectionManager;
use crate::error::{ReportError, Result};
use crate::models::{
    ConnectionDescriptor, DataSource, FileDescriptor, RetrievalSpec, Row, SourceKind,
    TabularResult,
};

/// Runs retrieval for any source kind.
pub struct Retriever {
    connections: Arc<ConnectionManager>,
    files: FilesConfig,
}

impl Retriever {
    pub fn new(connections: Arc<ConnectionManager>, files: FilesConfig) -> Self {
        Self { connections, files }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub async fn retrieve(&self, source: &DataSource, spec: &RetrievalSpec) -> Result<TabularResult> {
        tracing::debug!(source_id = %source.id, kind = %source.kind, "retrieving");
        match &source.kind {
            SourceKind::Spreadsheet => {
                let file = file_descriptor(source)?;
                let path = self.existing_path(&file.path)?;
                let sheet = spec.sheet_name.clone().or_else(|| file.sheet_name.clone());
                if is_delimited_text(&path) {
                    let delimiter = if has_extension(&path, "tsv") {
                        '\t'
                    } else {
                        file.delimiter
                    };
                    let has_header = file.has_header;
                    blocking(move || delimited::read_delimited(&path, delimiter, has_header)).await
                } else {
                    blocking(move || spreadsheet::read_sheet(&path, sheet.as_deref())).await
                }
            }
            SourceKind::FlatFile => {
                let file = file_descriptor(source)?;
                let path = self.existing_path(&file.path)?;
                let (delimiter, has_header) = (file.delimiter, file.has_header);
                blocking(move || delimited::read_delimited(&path, delimiter, has_header)).await
            }
            SourceKind::RelationalTable
            | SourceKind::RelationalQuery
            | SourceKind::RelationalProcedure => {
                let sql = spec
                    .query_text
                    .as_deref()
                    .map(str::trim)
                    .filter(|q| !q.is_empty())
                    .ok_or_else(|| ReportError::MissingQueryText {
                        source_id: source.id.clone(),
                    })?;
                let handle = self.connections.acquire(source).await?;
                handle.query(sql).await
            }
            SourceKind::Other(kind) => {
                tracing::warn!(
                    source_id = %source.id,
                    kind = %kind,
                    "no adapter for source kind, returning placeholder data"
                );
                Ok(placeholder_result(kind))
            }
        }
    }

    fn existing_path(&self, path: &Path) -> Result<PathBuf> {
        let resolved = self.files.resolve(path);
        if !resolved.is_file() {
            return Err(ReportError::SourceFileMissing(resolved));
        }
        Ok(resolved)
    }
}

fn file_descriptor(source: &DataSource) -> Result<&FileDescriptor> {
    match &source.descriptor {
        ConnectionDescriptor::File(file) => Ok(file),
        _ => Err(ReportError::DescriptorMismatch {
            kind: source.kind.to_string(),
        }),
    }
}

async fn blocking<F>(f: F) -> Result<TabularResult>
where
    F: FnOnce() -> Result<TabularResult> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(ReportError::retrieval)?
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

fn is_delimited_text(path: &Path) -> bool {
    ["csv", "tsv", "txt"].iter().any(|ext| has_extension(path, ext))
}

/// Sample rows standing in for a source kind that has no adapter yet.
pub fn placeholder_result(kind: &str) -> TabularResult {
    let columns = vec!["label".to_string(), "value".to_string()];
    let rows: Vec<Row> = [("sample-a", 10), ("sample-b", 20), ("sample-c", 30)]
        .iter()
        .map(|(label, value)| {
            let mut row = Row::new();
            row.insert(
                "label".to_string(),
                Value::from(format!("{} (placeholder for '{}')", label, kind)),
            );
            row.insert("value".to_string(), Value::from(*value));
            row
        })
        .collect();
    let mut result = TabularResult::new(columns, rows);
    result.placeholder = true;
    result
}

/// Make header names usable as unique row keys.
///
/// Blank names become `column_<n>` (1-based position); repeats get a
/// `_<k>` suffix starting at 2.
pub(crate) fn dedupe_columns(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(names.len());
    for (idx, name) in names.into_iter().enumerate() {
        let base = match name.trim() {
            "" => format!("column_{}", idx + 1),
            trimmed => trimmed.to_string(),
        };
        let mut candidate = base.clone();
        let mut suffix = 2;
        while seen.contains(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        seen.insert(candidate.clone());
        out.push(candidate);
    }
    out
}
