//! Delimited text (CSV/TSV) reader.

use serde_json::Value;
use std::path::Path;

use crate::error::{ReportError, Result};
use crate::models::{Row, TabularResult};

use super::dedupe_columns;

/// Read a delimited file into a [`TabularResult`].
///
/// With `has_header`, the first record names the columns; otherwise columns
/// are named `column_1..column_n`. Ragged records are accepted: short records
/// omit the missing keys, and cells past the header width get generated
/// column names. Values are kept as strings.
pub fn read_delimited(path: &Path, delimiter: char, has_header: bool) -> Result<TabularResult> {
    if !delimiter.is_ascii() {
        return Err(ReportError::Retrieval(format!(
            "delimiter {:?} is not a single-byte character",
            delimiter
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(ReportError::retrieval)?;

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| {
            ReportError::Retrieval(format!("{}: {}", path.display(), e))
        })?;
        records.push(record);
    }

    let mut records = records.into_iter();
    let header: Vec<String> = if has_header {
        match records.next() {
            Some(first) => first.iter().map(|h| h.to_string()).collect(),
            None => return Ok(TabularResult::default()),
        }
    } else {
        Vec::new()
    };
    let body: Vec<csv::StringRecord> = records.collect();

    let width = body
        .iter()
        .map(|r| r.len())
        .chain(std::iter::once(header.len()))
        .max()
        .unwrap_or(0);
    let mut names = header;
    names.resize(width, String::new());
    let columns = dedupe_columns(names);

    let rows: Vec<Row> = body
        .iter()
        .filter(|record| record.iter().any(|cell| !cell.trim().is_empty()))
        .map(|record| {
            let mut row = Row::new();
            for (idx, cell) in record.iter().enumerate() {
                row.insert(columns[idx].clone(), Value::from(cell.to_string()));
            }
            row
        })
        .collect();

    Ok(TabularResult::new(columns, rows))
}
