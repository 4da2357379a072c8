//! PostgreSQL query target.
//!
//! Runs the statement configured for each query type against a pooled
//! connection, binding the unit's quantity as `$1`. The whole result set is
//! read before the call returns, so the connection goes back to the pool
//! while the unit still holds its worker permit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as SqlxColumn, Row as SqlxRow, TypeInfo};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{QueryTarget, Row, TargetResponse, Value};
use crate::config::ConnectionConfig;
use crate::error::{BatchError, Result};
use crate::query::QueryType;

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// PostgreSQL-backed target.
#[derive(Debug, Clone)]
pub struct PostgresTarget {
    name: String,
    pool: PgPool,
    statements: Arc<HashMap<String, String>>,
}

impl PostgresTarget {
    /// Creates a target from an existing connection pool.
    pub fn from_pool(
        name: impl Into<String>,
        pool: PgPool,
        statements: Arc<HashMap<String, String>>,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            statements,
        }
    }

    /// Connects to the configured database, retrying transient failures.
    ///
    /// `max_connections` should be at least the dispatcher's worker count so
    /// that every unit holding a permit can get a connection.
    pub async fn connect(
        name: &str,
        config: &ConnectionConfig,
        max_connections: u32,
        statements: Arc<HashMap<String, String>>,
    ) -> Result<Self> {
        let conn_str = config.to_connection_string()?;

        let mut last_error = None;
        let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

        for attempt in 1..=MAX_RETRY_ATTEMPTS {
            debug!("Target {name}: connection attempt {attempt} of {MAX_RETRY_ATTEMPTS}");

            let result = PgPoolOptions::new()
                .max_connections(max_connections.max(1))
                .acquire_timeout(Duration::from_secs(10))
                .connect(&conn_str)
                .await;

            match result {
                Ok(pool) => {
                    debug!("Target {name}: connected to {}", config.display_string());
                    return Ok(Self::from_pool(name, pool, statements));
                }
                Err(e) => {
                    let is_transient = is_transient_error(&e);
                    last_error = Some(e);

                    if attempt < MAX_RETRY_ATTEMPTS && is_transient {
                        warn!(
                            "Target {name}: connection attempt {attempt} failed \
                             (transient error), retrying in {delay:?}"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => map_connection_error(e, name, config),
            None => BatchError::internal("no connection attempt was made"),
        })
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl QueryTarget for PostgresTarget {
    async fn invoke(
        &self,
        query_type: &QueryType,
        quantity: u64,
        cancel: CancellationToken,
    ) -> Result<TargetResponse> {
        let sql = self
            .statements
            .get(query_type.as_str())
            .cloned()
            .ok_or_else(|| {
                BatchError::target(format!(
                    "No statement configured for query type '{query_type}' on target {}",
                    self.name
                ))
            })?;
        let limit = i64::try_from(quantity)
            .map_err(|_| BatchError::target(format!("Quantity {quantity} exceeds BIGINT range")))?;

        let fetched = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(BatchError::target(format!("{} cancelled", self.name)));
            }
            fetched = sqlx::query(&sql).bind(limit).fetch_all(&self.pool) => fetched,
        };
        let rows: Vec<Row> = fetched
            .map_err(|e| BatchError::target(format_query_error(e)))?
            .iter()
            .map(convert_row)
            .collect();

        if rows.is_empty() {
            return Ok(TargetResponse::empty(format!("no rows from {}", self.name)));
        }
        Ok(TargetResponse::from_rows(
            format!("{} rows from {}", rows.len(), self.name),
            rows,
        ))
    }
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        // Everything else (text, numeric, dates) is read as a string.
        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
        || error_str.contains("does not exist")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to readable target errors.
fn map_connection_error(error: sqlx::Error, name: &str, config: &ConnectionConfig) -> BatchError {
    let error_str = error.to_string().to_lowercase();
    let endpoint = config.display_string();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        BatchError::target(format!(
            "Target {name}: cannot connect to {endpoint}. Check that the server is running."
        ))
    } else if error_str.contains("authentication failed") {
        BatchError::target(format!(
            "Target {name}: authentication failed for {endpoint}."
        ))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        BatchError::target(format!("Target {name}: connection to {endpoint} timed out."))
    } else {
        BatchError::target(format!("Target {name}: {error}"))
    }
}

/// Formats a query error with Postgres detail and hint when available.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = format!("ERROR: {}", db_error.message());
    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
    }
    result
}
