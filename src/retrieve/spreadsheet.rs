//! Spreadsheet (`.xlsx`) reader.
//!
//! Opens the workbook as a ZIP archive, resolves sheet names through
//! `xl/workbook.xml` and its relationships, and decodes one worksheet into
//! a [`TabularResult`]. The first non-empty row is the header; every later
//! row becomes an object keyed by header name. Cells are placed by their
//! `r` reference (e.g. `C7`) so sparse rows keep the right columns.
//!
//! Values: shared and inline strings become text, booleans become JSON
//! booleans, numbers become integers when integral and floats otherwise.
//! Date serials are left as numbers.

use quick_xml::events::{BytesStart, Event};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

use crate::error::{ReportError, Result};
use crate::models::{Row, TabularResult};

use super::dedupe_columns;

/// Maximum cells to decode per sheet.
const MAX_CELLS_PER_SHEET: usize = 1_000_000;
/// Excel's column limit (`XFD`). Wider references are rejected.
const MAX_COLUMNS: usize = 16_384;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 200 * 1024 * 1024;

/// Read `sheet` (or the first sheet) from the workbook at `path`.
pub fn read_sheet(path: &Path, sheet: Option<&str>) -> Result<TabularResult> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| invalid(path, e))?;

    let sheets = list_sheets(&mut archive).map_err(|e| invalid(path, e))?;
    let entry = match sheet {
        Some(wanted) => sheets
            .iter()
            .find(|(name, _)| name == wanted)
            .or_else(|| sheets.iter().find(|(name, _)| name.eq_ignore_ascii_case(wanted)))
            .map(|(_, entry)| entry.clone())
            .ok_or_else(|| ReportError::SheetNotFound(wanted.to_string()))?,
        None => sheets
            .first()
            .map(|(_, entry)| entry.clone())
            .ok_or_else(|| ReportError::Retrieval(format!("{}: workbook has no sheets", path.display())))?,
    };

    let shared_strings = if archive.index_for_name("xl/sharedStrings.xml").is_some() {
        read_shared_strings(&mut archive).map_err(|e| invalid(path, e))?
    } else {
        Vec::new()
    };

    let xml = read_zip_entry_bounded(&mut archive, &entry, MAX_XML_ENTRY_BYTES)
        .map_err(|e| invalid(path, e))?;
    let grid = read_sheet_cells(&xml, &shared_strings).map_err(|e| invalid(path, e))?;
    Ok(grid_to_result(grid))
}

/// List worksheet names in workbook order, without decoding any cells.
pub fn sheet_names(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| invalid(path, e))?;
    let sheets = list_sheets(&mut archive).map_err(|e| invalid(path, e))?;
    Ok(sheets.into_iter().map(|(name, _)| name).collect())
}

fn invalid(path: &Path, err: impl std::fmt::Display) -> ReportError {
    ReportError::Retrieval(format!("invalid workbook {}: {}", path.display(), err))
}

fn read_zip_entry_bounded<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
    name: &str,
    max_bytes: u64,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| format!("{}: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= max_bytes {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        ));
    }
    Ok(out)
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// `(sheet name, zip entry)` pairs in workbook order.
///
/// Falls back to `xl/worksheets/sheetN.xml` numbering when the workbook
/// part is absent, naming sheets `Sheet1`, `Sheet2`, ...
fn list_sheets<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> std::result::Result<Vec<(String, String)>, String> {
    if archive.index_for_name("xl/workbook.xml").is_none() {
        let mut entries: Vec<String> = archive
            .file_names()
            .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
            .map(|s| s.to_string())
            .collect();
        entries.sort_by_key(|name| {
            name.trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        });
        return Ok(entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| (format!("Sheet{}", i + 1), entry))
            .collect());
    }

    let rels = if archive.index_for_name("xl/_rels/workbook.xml.rels").is_some() {
        let xml = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", MAX_XML_ENTRY_BYTES)?;
        read_relationships(&xml)?
    } else {
        HashMap::new()
    };

    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml", MAX_XML_ENTRY_BYTES)?;
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&e, b"name").unwrap_or_default();
                let entry = attr(&e, b"id")
                    .and_then(|rid| rels.get(&rid).cloned())
                    .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", sheets.len() + 1));
                sheets.push((name, entry));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

/// Relationship id → ZIP entry path.
fn read_relationships(xml: &[u8]) -> std::result::Result<HashMap<String, String>, String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rels = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    let entry = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{}", target),
                    };
                    rels.insert(id, entry);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

/// Shared string table. Rich-text runs inside one `<si>` are concatenated.
fn read_shared_strings<R: Read + Seek>(
    archive: &mut zip::ZipArchive<R>,
) -> std::result::Result<Vec<String>, String> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    let mut buf = Vec::new();
    let mut current: Option<String> = None;
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_t = current.is_some(),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"si" => strings.push(String::new()),
            Ok(Event::Text(te)) if in_t => {
                if let Some(s) = current.as_mut() {
                    s.push_str(&te.unescape().map_err(|e| e.to_string())?);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.extend(current.take()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Row index → (column index → value). Both zero-based.
type Grid = BTreeMap<usize, BTreeMap<usize, Value>>;

#[derive(Default)]
struct PendingCell {
    col: usize,
    cell_type: String,
    text: String,
    has_value: bool,
}

fn read_sheet_cells(xml: &[u8], shared_strings: &[String]) -> std::result::Result<Grid, String> {
    let mut grid = Grid::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();

    let mut row_idx: usize = 0;
    let mut next_row: usize = 0;
    let mut next_col: usize = 0;
    let mut cell: Option<PendingCell> = None;
    let mut in_value = false;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= MAX_CELLS_PER_SHEET {
            tracing::warn!(limit = MAX_CELLS_PER_SHEET, "sheet truncated at cell limit");
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row_idx = attr(&e, b"r")
                        .and_then(|r| r.parse::<usize>().ok())
                        .map(|r| r.saturating_sub(1))
                        .unwrap_or(next_row);
                    next_row = row_idx + 1;
                    next_col = 0;
                }
                b"c" => {
                    let col = cell_column(&e, next_col)?;
                    next_col = col + 1;
                    cell = Some(PendingCell {
                        col,
                        cell_type: attr(&e, b"t").unwrap_or_default(),
                        ..PendingCell::default()
                    });
                }
                b"v" | b"t" => in_value = cell.is_some(),
                _ => {}
            },
            Ok(Event::Empty(e)) if e.local_name().as_ref() == b"c" => {
                next_col = cell_column(&e, next_col)? + 1;
            }
            Ok(Event::Text(te)) if in_value => {
                if let Some(c) = cell.as_mut() {
                    c.text.push_str(&te.unescape().map_err(|e| e.to_string())?);
                    c.has_value = true;
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    if let Some(c) = cell.take() {
                        if let Some(value) = cell_value(&c, shared_strings) {
                            grid.entry(row_idx).or_default().insert(c.col, value);
                            cell_count += 1;
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(grid)
}

fn cell_value(cell: &PendingCell, shared_strings: &[String]) -> Option<Value> {
    if !cell.has_value {
        return None;
    }
    let text = cell.text.as_str();
    let value = match cell.cell_type.as_str() {
        "s" => {
            let idx = text.trim().parse::<usize>().ok()?;
            Value::from(shared_strings.get(idx)?.clone())
        }
        "b" => Value::from(text.trim() == "1"),
        "inlineStr" | "str" | "e" => Value::from(text.to_string()),
        _ => number_value(text.trim())?,
    };
    match &value {
        Value::String(s) if s.is_empty() => None,
        _ => Some(value),
    }
}

fn number_value(text: &str) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    match text.parse::<f64>() {
        Ok(n) if n.is_finite() && n.fract() == 0.0 && n.abs() < 9.0e15 => Some(Value::from(n as i64)),
        Ok(n) if n.is_finite() => Some(Value::from(n)),
        _ => Some(Value::from(text.to_string())),
    }
}

/// Column of a `<c>` element: its `r` reference, or the next position when
/// the reference has no column letters.
fn cell_column(e: &BytesStart, next_col: usize) -> std::result::Result<usize, String> {
    let col = match attr(e, b"r") {
        Some(r) if r.starts_with(|c: char| c.is_ascii_alphabetic()) => column_index(&r)
            .ok_or_else(|| format!("cell reference {} is beyond column XFD", r))?,
        _ => next_col,
    };
    if col >= MAX_COLUMNS {
        return Err(format!("sheet is wider than {} columns", MAX_COLUMNS));
    }
    Ok(col)
}

/// Zero-based column index from an A1-style reference (`"AB12"` → 27).
///
/// `None` when there are no column letters or the column is past `XFD`.
fn column_index(reference: &str) -> Option<usize> {
    let letters = reference
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .collect::<Vec<u8>>();
    if letters.is_empty() || letters.len() > 3 {
        return None;
    }
    let mut idx = 0usize;
    for b in letters {
        idx = idx
            .checked_mul(26)?
            .checked_add((b.to_ascii_uppercase() - b'A' + 1) as usize)?;
    }
    Some(idx - 1).filter(|col| *col < MAX_COLUMNS)
}

fn grid_to_result(grid: Grid) -> TabularResult {
    let mut rows_iter = grid.into_iter();
    let header = match rows_iter.next() {
        Some((_, cells)) => cells,
        None => return TabularResult::default(),
    };
    let body: Vec<BTreeMap<usize, Value>> = rows_iter.map(|(_, cells)| cells).collect();

    let width = header
        .keys()
        .chain(body.iter().flat_map(|cells| cells.keys()))
        .max()
        .map(|max| max + 1)
        .unwrap_or(0);

    let names: Vec<String> = (0..width)
        .map(|i| match header.get(&i) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        })
        .collect();
    let columns = dedupe_columns(names);

    let rows: Vec<Row> = body
        .into_iter()
        .filter(|cells| !cells.is_empty())
        .map(|cells| {
            let mut row = Row::new();
            for (col, value) in cells {
                row.insert(columns[col].clone(), value);
            }
            row
        })
        .collect();

    TabularResult::new(columns, rows)
}
