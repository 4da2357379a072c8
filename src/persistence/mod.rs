//! Persistence layer for batchq.
//!
//! Query records live in a local SQLite database managed by [`StateDb`]; the
//! dispatcher talks to it through the [`QueryRecordStore`] trait so tests can
//! swap in [`MemoryRecordStore`].

mod memory;
mod migrations;
pub mod records;

pub use memory::MemoryRecordStore;
pub use records::{BatchId, BatchRecords, QueryRecord, QueryStatus, RecordId};

use crate::error::{BatchError, Result};
use crate::query::PartialQuery;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

const MAX_RETRY_ATTEMPTS: u32 = 3;
const RETRY_DELAY_MS: u64 = 100;

/// Durable record of each query unit's type, details and status.
///
/// Records are keyed by their own id, so concurrent units never contend for
/// the same row.
#[async_trait]
pub trait QueryRecordStore: Send + Sync {
    /// Creates one pending record per unit, all at once.
    async fn create_batch(&self, units: &[PartialQuery]) -> Result<BatchRecords>;

    /// Marks a pending record as picked up by a worker.
    async fn mark_in_flight(&self, id: RecordId) -> Result<()>;

    /// Writes the terminal status. Fails, leaving the record untouched, if a
    /// terminal status was already written.
    async fn set_terminal(&self, id: RecordId, status: QueryStatus, details: &str) -> Result<()>;

    /// Gets a record by id.
    async fn get(&self, id: RecordId) -> Result<Option<QueryRecord>>;

    /// Lists a batch's records in unit order.
    async fn list_batch(&self, batch_id: BatchId) -> Result<Vec<QueryRecord>>;
}

/// SQLite-backed state database.
pub struct StateDb {
    pool: SqlitePool,
    db_path: Option<PathBuf>,
}

impl StateDb {
    /// Opens or creates the state database at the default platform path.
    ///
    /// - Linux/macOS: `~/.config/db-batchq/state.db`
    /// - Windows: `%APPDATA%\db-batchq\state.db`
    pub async fn open_default() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open(&path).await
    }

    /// Opens or creates the state database at the specified path.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::ensure_parent_dirs(path)?;

        match Self::try_open(path).await {
            Ok(db) => Ok(db),
            Err(e) => {
                warn!("Failed to open state database: {e}. Attempting recovery...");
                Self::attempt_recovery(path).await
            }
        }
    }

    /// Opens a private in-memory database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                BatchError::persistence(format!("Failed to open in-memory database: {e}"))
            })?;
        migrations::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            db_path: None,
        })
    }

    /// Returns the default state database path for the current platform.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| BatchError::persistence("Could not determine config directory"))?;
        Ok(config_dir.join("db-batchq").join("state.db"))
    }

    /// Attempts to open the database with retries for lock contention.
    async fn try_open(path: &Path) -> Result<Self> {
        let mut last_error = None;

        for attempt in 0..MAX_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS * 2u64.pow(attempt))).await;
            }

            match Self::connect(path).await {
                Ok(pool) => {
                    migrations::run_migrations(&pool).await?;
                    info!("State database opened at {}", path.display());
                    return Ok(Self {
                        pool,
                        db_path: Some(path.to_path_buf()),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BatchError::persistence("Failed to open database after retries")))
    }

    /// Creates a connection pool to the SQLite database.
    async fn connect(path: &Path) -> Result<SqlitePool> {
        let conn_str = format!("sqlite:{}?mode=rwc", path.display());
        let options = SqliteConnectOptions::from_str(&conn_str)
            .map_err(|e| BatchError::persistence(format!("Invalid database path: {e}")))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true)
            .create_if_missing(true);

        SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                BatchError::persistence(format!("Failed to connect to state database: {e}"))
            })
    }

    /// Ensures parent directories exist for the database path.
    fn ensure_parent_dirs(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BatchError::persistence(format!(
                    "Failed to create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        Ok(())
    }

    /// Attempts to recover from a corrupted database by backing up and recreating.
    async fn attempt_recovery(path: &Path) -> Result<Self> {
        let backup_path = path.with_extension("db.bak");

        if path.exists() {
            std::fs::rename(path, &backup_path).map_err(|e| {
                BatchError::persistence(format!(
                    "Failed to backup corrupted database to {}: {e}",
                    backup_path.display()
                ))
            })?;
            warn!("Backed up corrupted database to {}", backup_path.display());
        }

        Self::try_open(path).await.map_err(|e| {
            BatchError::persistence(format!("Failed to recreate database after backup: {e}"))
        })
    }

    /// Returns the path to the state database, if it is on disk.
    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl QueryRecordStore for StateDb {
    async fn create_batch(&self, units: &[PartialQuery]) -> Result<BatchRecords> {
        records::create_batch(&self.pool, units).await
    }

    async fn mark_in_flight(&self, id: RecordId) -> Result<()> {
        records::mark_in_flight(&self.pool, id).await
    }

    async fn set_terminal(&self, id: RecordId, status: QueryStatus, details: &str) -> Result<()> {
        records::set_terminal(&self.pool, id, status, details).await
    }

    async fn get(&self, id: RecordId) -> Result<Option<QueryRecord>> {
        records::get_record(&self.pool, id).await
    }

    async fn list_batch(&self, batch_id: BatchId) -> Result<Vec<QueryRecord>> {
        records::list_batch(&self.pool, batch_id).await
    }
}
