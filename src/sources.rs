use anyhow::Result;

use crate::config::Config;
use crate::connection::EngineRegistry;
use crate::db;
use crate::models::{ConnectionDescriptor, DataSource, SourceKind};
use crate::retrieve::spreadsheet;
use crate::store::{SqliteStore, Store};

/// Readiness of a source as far as can be told without connecting.
pub fn source_health(source: &DataSource, config: &Config, engines: &EngineRegistry) -> String {
    if source.kind.is_relational() {
        return match &source.descriptor {
            ConnectionDescriptor::Relational(rel) if engines.find(&rel.engine).is_some() => {
                format!("OK ({})", rel.engine.to_lowercase())
            }
            ConnectionDescriptor::Relational(rel) => format!("UNKNOWN ENGINE ({})", rel.engine),
            _ => "DESCRIPTOR MISMATCH".to_string(),
        };
    }

    match &source.descriptor {
        ConnectionDescriptor::File(file) => {
            let path = config.files.resolve(&file.path);
            if !path.is_file() {
                return "FILE MISSING".to_string();
            }
            match (&source.kind, file.sheet_name.as_deref()) {
                (SourceKind::Spreadsheet, Some(sheet)) => match spreadsheet::sheet_names(&path) {
                    Ok(names) if names.iter().any(|n| n == sheet) => "OK".to_string(),
                    Ok(_) => format!("SHEET MISSING ({})", sheet),
                    Err(_) => "UNREADABLE".to_string(),
                },
                _ => "OK".to_string(),
            }
        }
        _ if matches!(source.kind, SourceKind::Spreadsheet | SourceKind::FlatFile) => {
            "DESCRIPTOR MISMATCH".to_string()
        }
        _ => "PLACEHOLDER".to_string(),
    }
}

pub async fn list_sources(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool);
    let sources = store.list_data_sources().await?;
    let engines = EngineRegistry::with_builtins();

    if sources.is_empty() {
        println!("No data sources. Load a catalog with `rpt load <catalog.toml>`.");
        return Ok(());
    }

    println!(
        "{:<20} {:<22} {:<10} {:<16} HEALTH",
        "SOURCE", "KIND", "STATUS", "MODIFIED"
    );
    for source in &sources {
        let modified = chrono::DateTime::from_timestamp_millis(source.last_modified())
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<20} {:<22} {:<10} {:<16} {}",
            source.id,
            source.kind,
            source.status,
            modified,
            source_health(source, config, &engines)
        );
    }

    Ok(())
}
