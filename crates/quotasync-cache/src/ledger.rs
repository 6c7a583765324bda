//! SQLite implementation of ILedger
//!
//! All records live in the single `files` table keyed by
//! `(path, src_dir_name)`. Every mutation is one statement whose `WHERE`
//! clause also pins the source state, so an update can never move a record
//! along an edge the state machine does not have.
//!
//! ## Type Mapping
//!
//! | Domain Type        | Column         | SQL Type | Strategy                         |
//! |--------------------|----------------|----------|----------------------------------|
//! | `path`             | `path`         | TEXT     | as-is                            |
//! | `tree`             | `src_dir_name` | TEXT     | as-is                            |
//! | `u64` size         | `size`         | INTEGER  | checked `i64` conversion         |
//! | `FileState`        | `state`        | TEXT     | `as_str()` / `FromStr`           |
//! | `Option<PathBuf>`  | `temp_path`    | TEXT     | UTF-8 path string                |
//! | `DateTime<Utc>`    | `created`      | INTEGER  | unix seconds                     |
//! | `Option<DateTime>` | `synced`       | INTEGER  | unix seconds                     |

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use quotasync_core::domain::{FileRecord, FileState};
use quotasync_core::ports::{ILedger, StateCounts};

use crate::CacheError;

const RECORD_COLUMNS: &str = "path, src_dir_name, size, state, temp_path, created, synced";

/// SQLite-based implementation of the ledger port
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Creates a new ledger with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn size_to_db(size: u64) -> Result<i64, CacheError> {
    i64::try_from(size)
        .map_err(|_| CacheError::SerializationError(format!("File size {size} out of range")))
}

fn size_from_db(size: i64) -> Result<u64, CacheError> {
    u64::try_from(size)
        .map_err(|_| CacheError::SerializationError(format!("Negative file size {size}")))
}

fn path_to_db(path: &Path) -> Result<&str, CacheError> {
    path.to_str().ok_or_else(|| {
        CacheError::SerializationError(format!("Non UTF-8 path: {}", path.display()))
    })
}

fn timestamp_from_db(secs: i64) -> Result<DateTime<Utc>, CacheError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CacheError::SerializationError(format!("Invalid timestamp {secs}")))
}

/// Reconstruct a FileRecord from a database row
/// States whose records sit in the staging area waiting for a transfer
fn awaiting_transfer() -> Vec<FileState> {
    FileState::ALL
        .into_iter()
        .filter(|state| state.awaits_transfer())
        .collect()
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord, CacheError> {
    let state_str: String = row.try_get("state")?;
    let state = state_str
        .parse::<FileState>()
        .map_err(|e| CacheError::SerializationError(e.to_string()))?;
    let temp_path: Option<String> = row.try_get("temp_path")?;
    let synced: Option<i64> = row.try_get("synced")?;

    Ok(FileRecord {
        path: row.try_get("path")?,
        tree: row.try_get("src_dir_name")?,
        size: size_from_db(row.try_get("size")?)?,
        state,
        staging_path: temp_path.map(PathBuf::from),
        created_at: timestamp_from_db(row.try_get("created")?)?,
        synced_at: synced.map(timestamp_from_db).transpose()?,
    })
}

// ============================================================================
// Queries
// ============================================================================

impl SqliteLedger {
    /// Retrieves the record for `(path, tree)`
    pub async fn find(&self, path: &str, tree: &str) -> Result<Option<FileRecord>, CacheError> {
        let sql =
            format!("SELECT {RECORD_COLUMNS} FROM files WHERE path = ? AND src_dir_name = ?");
        let row = sqlx::query(&sql)
            .bind(path)
            .bind(tree)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Inserts a `new` record unless the key exists; returns whether a row was added
    pub async fn insert_new(
        &self,
        path: &str,
        tree: &str,
        size: u64,
    ) -> Result<bool, CacheError> {
        let result = sqlx::query(
            "INSERT INTO files (path, src_dir_name, size, state, created) \
             VALUES (?, ?, ?, 'new', ?) \
             ON CONFLICT (path, src_dir_name) DO NOTHING",
        )
        .bind(path)
        .bind(tree)
        .bind(size_to_db(size)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// All records in `state`, in discovery order
    pub async fn list_in_state(&self, state: FileState) -> Result<Vec<FileRecord>, CacheError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM files WHERE state = ? ORDER BY rowid");
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn count_in_states(&self, states: &[FileState]) -> Result<u64, CacheError> {
        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!("SELECT COUNT(*) FROM files WHERE state IN ({placeholders})");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for state in states {
            query = query.bind(state.as_str());
        }
        let count = query.fetch_one(&self.pool).await?;
        size_from_db(count)
    }

    /// Moves every record in `from` to `to`, stamping `synced` when `to` is completed
    async fn transition_all(&self, from: FileState, to: FileState) -> Result<u64, CacheError> {
        from.transition_to(to)
            .map_err(|e| CacheError::InvalidTransition(e.to_string()))?;
        let result = if to == FileState::Completed {
            sqlx::query("UPDATE files SET state = ?, synced = ? WHERE state = ?")
                .bind(to.as_str())
                .bind(Utc::now().timestamp())
                .bind(from.as_str())
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("UPDATE files SET state = ? WHERE state = ?")
                .bind(to.as_str())
                .bind(from.as_str())
                .execute(&self.pool)
                .await?
        };

        let moved = result.rows_affected();
        if moved > 0 {
            tracing::debug!(from = %from, to = %to, count = moved, "Bulk state transition");
        }
        Ok(moved)
    }

    /// Staging paths of `completed` records whose `synced` is before `cutoff`
    pub async fn list_completed_synced_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let paths: Vec<Option<String>> = sqlx::query_scalar(
            "SELECT temp_path FROM files \
             WHERE state = 'completed' AND synced < ? \
             ORDER BY synced, rowid",
        )
        .bind(cutoff.timestamp())
        .fetch_all(&self.pool)
        .await?;

        Ok(paths.into_iter().flatten().map(PathBuf::from).collect())
    }
}

// ============================================================================
// ILedger implementation
// ============================================================================

#[async_trait::async_trait]
impl ILedger for SqliteLedger {
    async fn lookup(&self, path: &str, tree: &str) -> anyhow::Result<Option<FileRecord>> {
        Ok(self.find(path, tree).await?)
    }

    async fn insert(&self, path: &str, tree: &str, size: u64) -> anyhow::Result<bool> {
        let inserted = self.insert_new(path, tree, size).await?;
        if inserted {
            tracing::debug!(tree, path, size, "Recorded new file");
        }
        Ok(inserted)
    }

    async fn list_new(&self) -> anyhow::Result<Vec<FileRecord>> {
        Ok(self.list_in_state(FileState::New).await?)
    }

    async fn list_failed(&self) -> anyhow::Result<Vec<FileRecord>> {
        Ok(self.list_in_state(FileState::Failed).await?)
    }

    async fn has_new(&self) -> anyhow::Result<bool> {
        let exists: i64 =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM files WHERE state = 'new')")
                .fetch_one(&self.pool)
                .await
                .map_err(CacheError::from)?;
        Ok(exists != 0)
    }

    async fn count_queued_or_failed(&self) -> anyhow::Result<u64> {
        Ok(self.count_in_states(&awaiting_transfer()).await?)
    }

    async fn mark_queued(
        &self,
        path: &str,
        tree: &str,
        staging_path: &Path,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE files SET state = 'queued', temp_path = ? \
             WHERE path = ? AND src_dir_name = ? AND state = 'new'",
        )
        .bind(path_to_db(staging_path)?)
        .bind(path)
        .bind(tree)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;

        if result.rows_affected() == 0 {
            tracing::warn!(tree, path, "No new record to queue");
        }
        Ok(())
    }

    async fn mark_skipped(&self, path: &str, tree: &str) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE files SET state = 'skipped' \
             WHERE path = ? AND src_dir_name = ? AND state = 'new'",
        )
        .bind(path)
        .bind(tree)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;

        if result.rows_affected() == 0 {
            tracing::warn!(tree, path, "No new record to skip");
        }
        Ok(())
    }

    async fn mark_all_queued_completed(&self) -> anyhow::Result<u64> {
        Ok(self
            .transition_all(FileState::Queued, FileState::Completed)
            .await?)
    }

    async fn mark_all_failed_completed(&self) -> anyhow::Result<u64> {
        Ok(self
            .transition_all(FileState::Failed, FileState::Completed)
            .await?)
    }

    async fn mark_all_queued_failed(&self) -> anyhow::Result<u64> {
        Ok(self
            .transition_all(FileState::Queued, FileState::Failed)
            .await?)
    }

    async fn mark_deleted(&self, staging_path: &Path) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE files SET state = 'deleted' \
             WHERE temp_path = ? AND state = 'completed'",
        )
        .bind(path_to_db(staging_path)?)
        .execute(&self.pool)
        .await
        .map_err(CacheError::from)?;
        Ok(())
    }

    async fn list_expired_completed(&self, retention: Duration) -> anyhow::Result<Vec<PathBuf>> {
        let retention_secs = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let cutoff_secs = Utc::now().timestamp().saturating_sub(retention_secs);
        let cutoff = DateTime::from_timestamp(cutoff_secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
        Ok(self.list_completed_synced_before(cutoff).await?)
    }

    async fn current_completed_usage(&self) -> anyhow::Result<u64> {
        let used: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(size), 0) FROM files WHERE state = 'completed'")
                .fetch_one(&self.pool)
                .await
                .map_err(CacheError::from)?;
        Ok(size_from_db(used)?)
    }

    async fn count_by_state(&self) -> anyhow::Result<StateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM files GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(CacheError::from)?;

        let mut counts = StateCounts::new();
        for row in rows {
            let state_str: String = row.try_get("state").map_err(CacheError::from)?;
            let state = state_str
                .parse::<FileState>()
                .map_err(|e| CacheError::SerializationError(e.to_string()))?;
            let n: i64 = row.try_get("n").map_err(CacheError::from)?;
            counts.insert(state, size_from_db(n)?);
        }
        Ok(counts)
    }
}
