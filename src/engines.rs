//! Built-in relational engine drivers backed by sqlx pools.
//!
//! Each engine reports column metadata and value types differently; both
//! drivers normalize into the same [`TabularResult`] shape: column names in
//! statement order (deduplicated), one JSON object per row.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};
use std::sync::Arc;

use crate::config::PoolConfig;
use crate::connection::{ConnectionHandle, EngineDriver, RelationalClient};
use crate::error::{ReportError, Result};
use crate::models::{RelationalDescriptor, Row as ResultRow, TabularResult};
use crate::retrieve::dedupe_columns;

const PING_SQL: &str = "SELECT 1";

// ═══════════════════════════════════════════════════════════════════════
// PostgreSQL
// ═══════════════════════════════════════════════════════════════════════

pub struct PostgresDriver;

#[async_trait]
impl EngineDriver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn build(
        &self,
        descriptor: &RelationalDescriptor,
        pool: &PoolConfig,
    ) -> Result<ConnectionHandle> {
        let options = PgConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .username(&descriptor.user)
            .password(&descriptor.password)
            .database(&descriptor.database)
            .ssl_mode(if descriptor.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });

        let pool = PgPoolOptions::new()
            .min_connections(pool.min_connections)
            .max_connections(pool.max_connections)
            .acquire_timeout(pool.acquire_timeout())
            .idle_timeout(pool.idle_timeout())
            .connect_lazy_with(options);

        Ok(Arc::new(PostgresClient { pool }))
    }
}

struct PostgresClient {
    pool: PgPool,
}

#[async_trait]
impl RelationalClient for PostgresClient {
    fn engine(&self) -> &str {
        "postgres"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query(PING_SQL)
            .execute(&self.pool)
            .await
            .map_err(ReportError::retrieval)?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<TabularResult> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(ReportError::retrieval)?;

        let names: Vec<String> = match rows.first() {
            Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
            None => match (&self.pool).describe(sql).await {
                Ok(described) => described
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
                Err(e) => {
                    tracing::debug!(error = %e, "could not describe empty postgres result");
                    Vec::new()
                }
            },
        };
        let columns = dedupe_columns(names);

        let rows = rows
            .iter()
            .map(|row| {
                let mut out = ResultRow::new();
                for (idx, name) in columns.iter().enumerate() {
                    out.insert(name.clone(), pg_value(row, idx));
                }
                out
            })
            .collect();

        Ok(TabularResult::new(columns, rows))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn pg_value(row: &PgRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }

    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(idx).map(Value::from),
        "INT2" => row.try_get::<i16, _>(idx).map(Value::from),
        "INT4" => row.try_get::<i32, _>(idx).map(Value::from),
        "INT8" => row.try_get::<i64, _>(idx).map(Value::from),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| Value::from(v as f64)),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(Value::from),
        "NUMERIC" => row
            .try_get::<sqlx::types::Decimal, _>(idx)
            .map(|d| decimal_value(&d.to_string())),
        "UUID" => row
            .try_get::<sqlx::types::Uuid, _>(idx)
            .map(|u| Value::from(u.to_string())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|d| Value::from(d.to_string())),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|t| Value::from(t.to_string())),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|t| Value::from(t.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|t| Value::from(t.to_rfc3339())),
        "JSON" | "JSONB" => row.try_get::<Value, _>(idx),
        _ => row.try_get::<String, _>(idx).map(Value::from),
    };

    decoded.unwrap_or_else(|e| {
        tracing::debug!(column = idx, type_name = %type_name, error = %e, "undecodable postgres value");
        Value::Null
    })
}

// ═══════════════════════════════════════════════════════════════════════
// MySQL
// ═══════════════════════════════════════════════════════════════════════

pub struct MySqlDriver;

#[async_trait]
impl EngineDriver for MySqlDriver {
    fn name(&self) -> &str {
        "mysql"
    }

    async fn build(
        &self,
        descriptor: &RelationalDescriptor,
        pool: &PoolConfig,
    ) -> Result<ConnectionHandle> {
        let options = MySqlConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .username(&descriptor.user)
            .password(&descriptor.password)
            .database(&descriptor.database)
            .ssl_mode(if descriptor.ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Preferred
            });

        let pool = MySqlPoolOptions::new()
            .min_connections(pool.min_connections)
            .max_connections(pool.max_connections)
            .acquire_timeout(pool.acquire_timeout())
            .idle_timeout(pool.idle_timeout())
            .connect_lazy_with(options);

        Ok(Arc::new(MySqlClient { pool }))
    }
}

struct MySqlClient {
    pool: MySqlPool,
}

#[async_trait]
impl RelationalClient for MySqlClient {
    fn engine(&self) -> &str {
        "mysql"
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query(PING_SQL)
            .execute(&self.pool)
            .await
            .map_err(ReportError::retrieval)?;
        Ok(())
    }

    async fn query(&self, sql: &str) -> Result<TabularResult> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(ReportError::retrieval)?;

        let names: Vec<String> = match rows.first() {
            Some(first) => first.columns().iter().map(|c| c.name().to_string()).collect(),
            None => match (&self.pool).describe(sql).await {
                Ok(described) => described
                    .columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect(),
                Err(e) => {
                    tracing::debug!(error = %e, "could not describe empty mysql result");
                    Vec::new()
                }
            },
        };
        let columns = dedupe_columns(names);

        let rows = rows
            .iter()
            .map(|row| {
                let mut out = ResultRow::new();
                for (idx, name) in columns.iter().enumerate() {
                    out.insert(name.clone(), mysql_value(row, idx));
                }
                out
            })
            .collect();

        Ok(TabularResult::new(columns, rows))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn mysql_value(row: &MySqlRow, idx: usize) -> Value {
    match row.try_get_raw(idx) {
        Ok(raw) if !raw.is_null() => {}
        _ => return Value::Null,
    }

    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let decoded = match type_name.as_str() {
        "BOOLEAN" => row.try_get::<bool, _>(idx).map(Value::from),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            row.try_get::<i64, _>(idx).map(Value::from)
        }
        t if t.ends_with("UNSIGNED") => row.try_get::<u64, _>(idx).map(Value::from),
        "FLOAT" => row.try_get::<f32, _>(idx).map(|v| Value::from(v as f64)),
        "DOUBLE" => row.try_get::<f64, _>(idx).map(Value::from),
        "DECIMAL" => row
            .try_get::<sqlx::types::Decimal, _>(idx)
            .map(|d| decimal_value(&d.to_string())),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|d| Value::from(d.to_string())),
        "TIME" => row
            .try_get::<chrono::NaiveTime, _>(idx)
            .map(|t| Value::from(t.to_string())),
        "DATETIME" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|t| Value::from(t.to_string())),
        "TIMESTAMP" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|t| Value::from(t.to_rfc3339())),
        "JSON" => row.try_get::<Value, _>(idx),
        _ => row.try_get::<String, _>(idx).map(Value::from).or_else(|_| {
            row.try_get::<Vec<u8>, _>(idx)
                .map(|bytes| Value::from(String::from_utf8_lossy(&bytes).into_owned()))
        }),
    };

    decoded
        .or_else(|_| row.try_get::<i64, _>(idx).map(Value::from))
        .unwrap_or_else(|e| {
            tracing::debug!(column = idx, type_name = %type_name, error = %e, "undecodable mysql value");
            Value::Null
        })
}

/// Decimals become JSON numbers when they fit an `f64`, text otherwise.
fn decimal_value(text: &str) -> Value {
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() => Value::from(v),
        _ => Value::from(text.to_string()),
    }
}
