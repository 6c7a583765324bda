//! File ledger port (driven/secondary port)
//!
//! This module defines the interface for the durable record of every
//! discovered file and its transfer state.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite today) and don't need domain-level classification.
//! - Records are addressed by their natural key `(path, tree)`; the only
//!   exception is [`ILedger::mark_deleted`], which is keyed by staging path
//!   because expiry works from the staging paths it listed.
//! - The bulk `mark_all_*` transitions exist because the transfer tool
//!   mirrors the whole staging tree at once and cannot report per-file
//!   outcomes. They return the number of records moved.
//! - Every mutation is a single statement guarded by the source state, so a
//!   transition never applies to a record in the wrong state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{FileRecord, FileState};

/// Number of records per state
pub type StateCounts = BTreeMap<FileState, u64>;

/// Port trait for the persistent file ledger
///
/// A single writer (the sync loop) is assumed; implementations only need
/// per-statement atomicity.
#[async_trait::async_trait]
pub trait ILedger: Send + Sync {
    /// Retrieves the record for `(path, tree)`, if any
    async fn lookup(&self, path: &str, tree: &str) -> anyhow::Result<Option<FileRecord>>;

    /// Creates a `new` record; does nothing if the key already exists
    ///
    /// Returns `true` if a record was created.
    async fn insert(&self, path: &str, tree: &str, size: u64) -> anyhow::Result<bool>;

    /// All `new` records, in discovery order
    async fn list_new(&self) -> anyhow::Result<Vec<FileRecord>>;

    /// All `failed` records, in discovery order
    async fn list_failed(&self) -> anyhow::Result<Vec<FileRecord>>;

    /// Returns true if at least one record is `new`
    async fn has_new(&self) -> anyhow::Result<bool>;

    /// Number of records that are `queued` or `failed`
    async fn count_queued_or_failed(&self) -> anyhow::Result<u64>;

    /// `new -> queued`, recording where the staging copy lives
    async fn mark_queued(&self, path: &str, tree: &str, staging_path: &Path)
        -> anyhow::Result<()>;

    /// `new -> skipped`
    async fn mark_skipped(&self, path: &str, tree: &str) -> anyhow::Result<()>;

    /// Every `queued` record becomes `completed`, stamped with the current time
    async fn mark_all_queued_completed(&self) -> anyhow::Result<u64>;

    /// Every `failed` record becomes `completed`, stamped with the current time
    async fn mark_all_failed_completed(&self) -> anyhow::Result<u64>;

    /// Every `queued` record becomes `failed`
    async fn mark_all_queued_failed(&self) -> anyhow::Result<u64>;

    /// `completed -> deleted` for the record staged at `staging_path`
    async fn mark_deleted(&self, staging_path: &Path) -> anyhow::Result<()>;

    /// Staging paths of `completed` records synced more than `retention` ago
    async fn list_expired_completed(&self, retention: Duration) -> anyhow::Result<Vec<PathBuf>>;

    /// Sum of sizes of all `completed` records, i.e. the space used remotely
    async fn current_completed_usage(&self) -> anyhow::Result<u64>;

    /// Record count per state (states with no records are omitted)
    async fn count_by_state(&self) -> anyhow::Result<StateCounts>;
}
