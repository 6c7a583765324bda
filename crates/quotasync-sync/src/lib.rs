//! QuotaSync Sync - Watch, admit and offload
//!
//! Provides:
//! - Recursive, self-healing directory watching on top of `notify`
//! - Source tree scanning into the file ledger
//! - Quota-aware admission of new files into the staging area
//! - The rsync-over-ssh transfer adapter
//! - The sync loop sequencing all of the above
//!
//! ## Modules
//!
//! - [`engine`] - The sync loop (discover, expire, retry, admit, sync)
//! - [`watcher`] - Directory watcher producing the set of changed trees
//! - [`scanner`] - Recursive file enumeration of a source tree
//! - [`admission`] - Quota-constrained staging of new files
//! - [`transfer`] - `rsync` mirror of the staging area and post-sync hook

pub mod admission;
pub mod engine;
pub mod scanner;
pub mod transfer;
pub mod watcher;

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// Creating a directory in the staging area failed
    #[error("Failed to create staging directory {path}: {source}")]
    StagingDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Copying a source file into the staging area failed
    #[error("Failed to copy {from} to staging destination {to}: {source}")]
    StagingCopy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading a source file's metadata failed
    #[error("Failed to stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transfer tool or post-sync command could not be started
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The OS watcher could not be created
    #[error("Failed to initialize directory watcher: {0}")]
    WatcherInit(#[from] notify::Error),

    /// A domain-level error propagated from quotasync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] quotasync_core::domain::DomainError),
}
