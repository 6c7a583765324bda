//! QuotaSync Cache - Local file ledger
//!
//! SQLite-backed ledger recording every discovered file and its transfer
//! state.
//!
//! ## Architecture
//!
//! This crate implements the `ILedger` port from `quotasync-core` using
//! SQLite as the storage backend. It is a driven (secondary) adapter.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool with migration support
//! - [`SqliteLedger`] - Full `ILedger` implementation
//! - [`CacheError`] - Error types for ledger operations
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::Path;
//! use quotasync_cache::{DatabasePool, SqliteLedger};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/var/lib/quotasync/state.db")).await?;
//! let ledger = SqliteLedger::new(pool.pool().clone());
//! // Use ledger as ILedger...
//! # Ok(())
//! # }
//! ```

pub mod ledger;
pub mod pool;

pub use ledger::SqliteLedger;
pub use pool::DatabasePool;

/// Errors that can occur during ledger operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A bulk update was requested along an edge the state machine lacks
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A stored value could not be converted to or from its domain type
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
