//! `rpt run` and `rpt query`: execute a report and print the result as JSON.

use anyhow::{bail, Result};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::models::{AggregateOp, ProjectionSpec, RetrievalSpec, TabularResult};
use crate::pipeline::ReportPipeline;

/// Ad-hoc query parameters from the command line.
#[derive(Debug, Default)]
pub struct QueryOptions {
    pub source: String,
    pub sql: Option<String>,
    pub sheet: Option<String>,
    pub select: Vec<String>,
    pub group_by: Option<String>,
    /// `(column, op)` pairs from `--agg column=op`.
    pub aggregates: Vec<(String, String)>,
}

impl QueryOptions {
    pub fn retrieval(&self) -> RetrievalSpec {
        RetrievalSpec {
            source_id: self.source.clone(),
            query_text: self.sql.clone(),
            sheet_name: self.sheet.clone(),
            ..RetrievalSpec::default()
        }
    }

    pub fn projection(&self) -> Result<ProjectionSpec> {
        let mut aggregates = BTreeMap::new();
        for (column, op) in &self.aggregates {
            let op: AggregateOp = match op.parse() {
                Ok(op) => op,
                Err(e) => bail!("--agg {}={}: {}", column, op, e),
            };
            aggregates.insert(column.clone(), op);
        }
        Ok(ProjectionSpec {
            selected_columns: self
                .select
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            aggregates,
            group_by: self.group_by.clone(),
        })
    }
}

fn print_result(result: &TabularResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    if result.placeholder {
        eprintln!("note: placeholder data, no adapter exists for this source kind");
    }
    Ok(())
}

pub async fn run_report(config: &Config, report_id: &str) -> Result<()> {
    let pipeline = ReportPipeline::open(config).await?;
    let outcome = pipeline.run_report(report_id).await;
    pipeline.connections().release_all().await;
    print_result(&outcome?)
}

pub async fn run_query(config: &Config, options: &QueryOptions) -> Result<()> {
    let projection = options.projection()?;
    let pipeline = ReportPipeline::open(config).await?;
    let outcome = pipeline.run_adhoc(&options.retrieval(), &projection).await;
    pipeline.connections().release_all().await;
    print_result(&outcome?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_projection_from_options() {
        let options = QueryOptions {
            source: "sales".to_string(),
            select: vec!["region".to_string(), " sales ".to_string(), "".to_string()],
            group_by: Some("region".to_string()),
            aggregates: vec![("sales".to_string(), "sum".to_string())],
            ..QueryOptions::default()
        };
        let projection = options.projection().unwrap();
        assert_eq!(projection.selected_columns, vec!["region", "sales"]);
        assert_eq!(projection.aggregates.get("sales"), Some(&AggregateOp::Sum));
        assert_eq!(options.retrieval().source_id, "sales");
    }

    #[test]
    fn test_unknown_aggregate_rejected() {
        let options = QueryOptions {
            aggregates: vec![("sales".to_string(), "median".to_string())],
            ..QueryOptions::default()
        };
        let err = options.projection().unwrap_err();
        assert!(err.to_string().contains("median"));
    }
}
