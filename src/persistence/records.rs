//! Query record persistence.
//!
//! One record per dispatched unit: created `pending` before dispatch, moved to
//! `in_flight` when a worker picks it up, and written exactly once with a
//! terminal status.

use crate::error::{BatchError, Result};
use crate::query::PartialQuery;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use std::fmt;
use tracing::warn;

/// Terminal records older than this are pruned.
const MAX_RECORD_DAYS: i64 = 90;

/// Generated identity of a query record.
pub type RecordId = i64;

/// Generated identity of a batch.
pub type BatchId = i64;

/// Lifecycle status of a query record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    TimedOut,
}

impl QueryStatus {
    /// Returns the status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    /// Parses a stored status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_flight" => Some(Self::InFlight),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Returns true once a record can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::TimedOut)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted query record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRecord {
    pub id: RecordId,
    pub batch_id: BatchId,
    pub unit_index: usize,
    pub target_id: String,
    pub query_type: String,
    pub quantity: u64,
    pub status: QueryStatus,
    pub details: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Raw database row for a query record.
#[derive(Debug, Clone, FromRow)]
struct QueryRecordRow {
    id: i64,
    batch_id: i64,
    unit_index: i64,
    target_id: String,
    query_type: String,
    quantity: i64,
    status: String,
    details: Option<String>,
    created_at: String,
    updated_at: String,
}

impl TryFrom<QueryRecordRow> for QueryRecord {
    type Error = BatchError;

    fn try_from(row: QueryRecordRow) -> Result<Self> {
        let status = QueryStatus::parse(&row.status).ok_or_else(|| {
            BatchError::persistence(format!(
                "Record {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;
        Ok(Self {
            id: row.id,
            batch_id: row.batch_id,
            unit_index: row.unit_index as usize,
            target_id: row.target_id,
            query_type: row.query_type,
            quantity: row.quantity as u64,
            status,
            details: row.details,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Identities created for one batch; `record_ids[i]` belongs to unit `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecords {
    pub batch_id: BatchId,
    pub record_ids: Vec<RecordId>,
}

/// Creates a batch and one pending record per unit in a single transaction.
pub async fn create_batch(pool: &SqlitePool, units: &[PartialQuery]) -> Result<BatchRecords> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| BatchError::persistence(format!("Failed to begin transaction: {e}")))?;

    let batch_id = sqlx::query("INSERT INTO batches (unit_count) VALUES (?)")
        .bind(units.len() as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| BatchError::persistence(format!("Failed to create batch: {e}")))?
        .last_insert_rowid();

    let mut record_ids = Vec::with_capacity(units.len());
    for unit in units {
        let quantity = i64::try_from(unit.quantity()).map_err(|_| {
            BatchError::persistence(format!(
                "Quantity {} at index {} exceeds storable range",
                unit.quantity(),
                unit.index()
            ))
        })?;

        let id = sqlx::query(
            r#"
            INSERT INTO query_records
            (batch_id, unit_index, target_id, query_type, quantity, status)
            VALUES (?, ?, ?, ?, ?, 'pending')
            "#,
        )
        .bind(batch_id)
        .bind(unit.index() as i64)
        .bind(unit.target_id().as_str())
        .bind(unit.query_type().as_str())
        .bind(quantity)
        .execute(&mut *tx)
        .await
        .map_err(|e| BatchError::persistence(format!("Failed to create query record: {e}")))?
        .last_insert_rowid();

        record_ids.push(id);
    }

    tx.commit()
        .await
        .map_err(|e| BatchError::persistence(format!("Failed to commit batch: {e}")))?;

    // The batch is committed; a failed prune must not orphan its records.
    if let Err(e) = prune_old_records(pool).await {
        warn!("Batch {batch_id}: {e}");
    }

    Ok(BatchRecords {
        batch_id,
        record_ids,
    })
}

/// Moves a pending record to `in_flight`.
pub async fn mark_in_flight(pool: &SqlitePool, id: RecordId) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE query_records
        SET status = 'in_flight', updated_at = datetime('now')
        WHERE id = ? AND status = 'pending'
        "#,
    )
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| BatchError::persistence(format!("Failed to mark record in flight: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(explain_rejected_write(pool, id).await);
    }
    Ok(())
}

/// Writes a terminal status. A record that is already terminal is left as is
/// and the write is rejected.
pub async fn set_terminal(
    pool: &SqlitePool,
    id: RecordId,
    status: QueryStatus,
    details: &str,
) -> Result<()> {
    if !status.is_terminal() {
        return Err(BatchError::internal(format!(
            "'{status}' is not a terminal status"
        )));
    }

    let result = sqlx::query(
        r#"
        UPDATE query_records
        SET status = ?, details = ?, updated_at = datetime('now')
        WHERE id = ? AND status IN ('pending', 'in_flight')
        "#,
    )
    .bind(status.as_str())
    .bind(details)
    .bind(id)
    .execute(pool)
    .await
    .map_err(|e| BatchError::persistence(format!("Failed to update query record: {e}")))?;

    if result.rows_affected() == 0 {
        return Err(explain_rejected_write(pool, id).await);
    }
    Ok(())
}

async fn explain_rejected_write(pool: &SqlitePool, id: RecordId) -> BatchError {
    match get_record(pool, id).await {
        Ok(Some(record)) => BatchError::persistence(format!(
            "Record {id} already {}",
            if record.status.is_terminal() {
                "terminal"
            } else {
                record.status.as_str()
            }
        )),
        Ok(None) => BatchError::persistence(format!("Record {id} not found")),
        Err(e) => e,
    }
}

/// Gets a single record by ID.
pub async fn get_record(pool: &SqlitePool, id: RecordId) -> Result<Option<QueryRecord>> {
    let row: Option<QueryRecordRow> = sqlx::query_as(
        r#"
        SELECT id, batch_id, unit_index, target_id, query_type, quantity,
               status, details, created_at, updated_at
        FROM query_records
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .map_err(|e| BatchError::persistence(format!("Failed to get query record: {e}")))?;

    row.map(QueryRecord::try_from).transpose()
}

/// Lists the records of a batch in unit order.
pub async fn list_batch(pool: &SqlitePool, batch_id: BatchId) -> Result<Vec<QueryRecord>> {
    let rows: Vec<QueryRecordRow> = sqlx::query_as(
        r#"
        SELECT id, batch_id, unit_index, target_id, query_type, quantity,
               status, details, created_at, updated_at
        FROM query_records
        WHERE batch_id = ?
        ORDER BY unit_index
        "#,
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await
    .map_err(|e| BatchError::persistence(format!("Failed to list batch records: {e}")))?;

    rows.into_iter().map(QueryRecord::try_from).collect()
}

/// Counts all records.
pub async fn count_records(pool: &SqlitePool) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM query_records")
        .fetch_one(pool)
        .await
        .map_err(|e| BatchError::persistence(format!("Failed to count records: {e}")))?;

    Ok(count)
}

/// Prunes terminal records beyond the retention window, and batches left
/// without records.
async fn prune_old_records(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM query_records
        WHERE status IN ('succeeded', 'failed', 'timed_out')
          AND updated_at < datetime('now', ? || ' days')
        "#,
    )
    .bind(-MAX_RECORD_DAYS)
    .execute(pool)
    .await
    .map_err(|e| BatchError::persistence(format!("Failed to prune old records: {e}")))?;

    sqlx::query(
        r#"
        DELETE FROM batches
        WHERE unit_count > 0
          AND id NOT IN (SELECT DISTINCT batch_id FROM query_records)
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| BatchError::persistence(format!("Failed to prune empty batches: {e}")))?;

    Ok(())
}
