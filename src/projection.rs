//! Column selection and single-dimension grouped aggregation.
//!
//! [`project`] is a pure function of its inputs: the same result and spec
//! always produce the same rows in the same order. The dimension and
//! measure are chosen in selection order, but grouping reads the source
//! rows, so a `group_by` or measure column left out of the selection still
//! groups correctly. Aggregation, when any aggregate op other than `NONE`
//! applies, collapses the result to exactly two columns,
//! `[dimension, measure]`, one row per distinct dimension value in
//! first-seen order.
//!
//! Selection is lenient: a selected column missing from a row is simply
//! absent from the output row.

use serde_json::{Number, Value};
use std::collections::HashMap;

use crate::models::{AggregateOp, ProjectionSpec, Row, TabularResult};

/// Apply `spec` to `input`.
pub fn project(input: &TabularResult, spec: &ProjectionSpec) -> TabularResult {
    let selected = select(input, &spec.selected_columns);

    match plan(&selected.columns, spec) {
        Some(plan) => aggregate(input, &plan),
        None => selected,
    }
}

fn select(input: &TabularResult, columns: &[String]) -> TabularResult {
    if columns.is_empty() {
        return input.clone();
    }
    let rows = input
        .rows
        .iter()
        .map(|row| {
            let mut out = Row::new();
            for col in columns {
                if let Some(value) = row.get(col) {
                    out.insert(col.clone(), value.clone());
                }
            }
            out
        })
        .collect();

    TabularResult {
        columns: columns.to_vec(),
        rows,
        total_row_count: input.total_row_count,
        placeholder: input.placeholder,
    }
}

struct Plan {
    dimension: String,
    measure: String,
    op: AggregateOp,
}

/// Choose the dimension and measure for a reduction, if there is one.
fn plan(columns: &[String], spec: &ProjectionSpec) -> Option<Plan> {
    let active = |col: &String| match spec.aggregates.get(col) {
        Some(AggregateOp::None) | None => None,
        Some(op) => Some(*op),
    };

    let (measure, op) = columns
        .iter()
        .chain(spec.aggregates.keys())
        .find_map(|col| active(col).map(|op| (col.clone(), op)))?;

    let dimension = match &spec.group_by {
        Some(group_by) if *group_by != measure => group_by.clone(),
        Some(_) => return None,
        None => columns.iter().find(|col| **col != measure)?.clone(),
    };

    Some(Plan {
        dimension,
        measure,
        op,
    })
}

fn aggregate(input: &TabularResult, plan: &Plan) -> TabularResult {
    let mut groups: Vec<(Value, Vec<Value>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in &input.rows {
        let key_value = row.get(&plan.dimension).cloned().unwrap_or(Value::Null);
        let key = key_value.to_string();
        let slot = *index.entry(key).or_insert_with(|| {
            groups.push((key_value, Vec::new()));
            groups.len() - 1
        });
        if let Some(value) = row.get(&plan.measure) {
            groups[slot].1.push(value.clone());
        }
    }

    let rows = groups
        .into_iter()
        .map(|(dimension, values)| {
            let mut row = Row::new();
            row.insert(plan.dimension.clone(), dimension);
            row.insert(plan.measure.clone(), reduce(plan.op, &values));
            row
        })
        .collect();

    TabularResult {
        columns: vec![plan.dimension.clone(), plan.measure.clone()],
        rows,
        total_row_count: input.total_row_count,
        placeholder: input.placeholder,
    }
}

/// Numeric view of a cell. Non-numeric values return `None`.
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn reduce(op: AggregateOp, values: &[Value]) -> Value {
    if op == AggregateOp::Count {
        return Value::from(values.iter().filter(|v| !v.is_null()).count());
    }

    let numbers: Vec<f64> = values.iter().filter_map(coerce_number).collect();
    if numbers.is_empty() {
        return Value::Null;
    }

    let reduced = match op {
        AggregateOp::Sum => numbers.iter().sum(),
        AggregateOp::Avg => numbers.iter().sum::<f64>() / numbers.len() as f64,
        AggregateOp::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateOp::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateOp::Count | AggregateOp::None => return Value::Null,
    };
    number_value(reduced)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}
