//! Ledger database handle
//!
//! The ledger lives in one SQLite file whose location comes from
//! `database.path`. Opening it creates missing parent directories and the
//! file itself, then applies the `files` schema. The schema script only uses
//! `IF NOT EXISTS` statements, so reopening an existing ledger keeps its rows.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// Schema of the `files` table and its indexes
const LEDGER_SCHEMA: &str = include_str!("migrations/0001_files.sql");

/// The sync loop is the only writer; a second connection serves readers such
/// as `sqlite3` run by an operator against the WAL file.
const FILE_CONNECTIONS: u32 = 2;

/// How long a statement waits on a lock held by another connection
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open connection pool over the file ledger
#[derive(Debug, Clone)]
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (or creates) the ledger at `db_path` in WAL mode
    ///
    /// # Errors
    ///
    /// `CacheError::ConnectionFailed` when the parent directory cannot be
    /// created or SQLite refuses the file; `CacheError::MigrationFailed` when
    /// the schema cannot be applied.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot create ledger directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot open ledger {}: {e}",
                    db_path.display()
                ))
            })?;

        let ledger = Self::with_schema(pool).await?;
        tracing::info!(path = %db_path.display(), "Ledger opened");
        Ok(ledger)
    }

    /// Opens a throwaway ledger held in memory
    ///
    /// An in-memory SQLite database belongs to a single connection, so the
    /// pool is capped at one.
    ///
    /// # Errors
    ///
    /// Same as [`DatabasePool::new`].
    pub async fn in_memory() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory ledger: {e}")))?;

        Self::with_schema(pool).await
    }

    /// The pool handed to [`SqliteLedger`](crate::SqliteLedger)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn with_schema(pool: SqlitePool) -> Result<Self, CacheError> {
        sqlx::raw_sql(LEDGER_SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(format!("files schema: {e}")))?;

        tracing::debug!("Ledger schema applied");
        Ok(Self { pool })
    }
}
