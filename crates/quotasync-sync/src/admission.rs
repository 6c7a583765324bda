//! Quota-constrained admission of new files
//!
//! One pass over the ledger's `new` records, in discovery order. A file is
//! copied into the staging area only if the bytes already confirmed on the
//! remote side plus everything admitted earlier in the pass still fit under
//! the configured maximum. The first file that does not fit ends the pass, so
//! a large file is never overtaken by smaller ones discovered after it.
//!
//! Files larger than the maximum on their own can never fit and are marked
//! `skipped`.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use quotasync_core::ports::ILedger;

use crate::SyncError;

/// Outcome of one admission pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdmissionReport {
    /// Files copied into staging and marked `queued`
    pub queued: usize,
    /// Files larger than the maximum, marked `skipped`
    pub skipped: usize,
    /// Files whose source disappeared since discovery, left `new`
    pub unavailable: usize,
    /// Files left `new` because the pass stopped at one that did not fit
    pub deferred: usize,
    /// Bytes copied into staging during the pass
    pub bytes_admitted: u64,
    /// Completed usage at the start of the pass plus `bytes_admitted`
    pub running_total: u64,
}

/// Stages as many `new` files as the quota allows
///
/// `trees` maps source tree names to their roots; staged copies land at
/// `<staging_root>/<tree>/<path>`.
///
/// # Errors
///
/// Ledger failures, failing to create a staging directory, failing to copy a
/// file, and metadata errors other than not-found abort the pass.
pub async fn admit_new_files<L>(
    ledger: &L,
    trees: &BTreeMap<String, PathBuf>,
    staging_root: &Path,
    max_bytes: u64,
) -> anyhow::Result<AdmissionReport>
where
    L: ILedger + ?Sized,
{
    let baseline = ledger.current_completed_usage().await?;
    let candidates = ledger.list_new().await?;

    let mut report = AdmissionReport {
        running_total: baseline,
        ..Default::default()
    };

    if candidates.is_empty() {
        return Ok(report);
    }
    debug!(candidates = candidates.len(), baseline, max_bytes, "Starting admission pass");

    for (index, record) in candidates.iter().enumerate() {
        let Some(root) = trees.get(&record.tree) else {
            warn!(tree = %record.tree, path = %record.path, "Source directory is not configured");
            report.unavailable += 1;
            continue;
        };
        let key = record.key().map_err(SyncError::from)?;
        let source = root.join(&record.path);

        let size = match tokio::fs::metadata(&source).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %source.display(), "Source file vanished before admission");
                report.unavailable += 1;
                continue;
            }
            Err(e) => {
                return Err(SyncError::Stat {
                    path: source,
                    source: e,
                }
                .into())
            }
        };

        if size > max_bytes {
            warn!(
                path = %source.display(),
                size,
                max_bytes,
                "File exceeds the destination size limit, skipping"
            );
            ledger.mark_skipped(&record.path, &record.tree).await?;
            report.skipped += 1;
            continue;
        }

        if report.running_total.saturating_add(size) > max_bytes {
            report.deferred = candidates.len() - index;
            info!(
                path = %source.display(),
                size,
                used = report.running_total,
                max_bytes,
                deferred = report.deferred,
                "Destination quota reached, deferring remaining files"
            );
            break;
        }

        let dest = key.staging_path(staging_root);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SyncError::StagingDir {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        tokio::fs::copy(&source, &dest)
            .await
            .map_err(|e| SyncError::StagingCopy {
                from: source.clone(),
                to: dest.clone(),
                source: e,
            })?;

        ledger.mark_queued(&record.path, &record.tree, &dest).await?;
        report.queued += 1;
        report.bytes_admitted += size;
        report.running_total += size;
        debug!(tree = %record.tree, path = %record.path, size, "Admitted file to staging");
    }

    if report.queued > 0 || report.skipped > 0 {
        info!(
            queued = report.queued,
            skipped = report.skipped,
            deferred = report.deferred,
            bytes = report.bytes_admitted,
            used = report.running_total,
            "Admission pass finished"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotasync_cache::{DatabasePool, SqliteLedger};
    use quotasync_core::domain::FileState;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        _pool: DatabasePool,
        ledger: SqliteLedger,
        source: TempDir,
        staging: TempDir,
        trees: BTreeMap<String, PathBuf>,
    }

    async fn fixture() -> Fixture {
        let pool = DatabasePool::in_memory().await.unwrap();
        let ledger = SqliteLedger::new(pool.pool().clone());
        let source = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let trees = BTreeMap::from([("cams".to_string(), source.path().to_path_buf())]);
        Fixture {
            _pool: pool,
            ledger,
            source,
            staging,
            trees,
        }
    }

    impl Fixture {
        /// Writes a source file of `size` bytes and records it as discovered
        async fn discover(&self, path: &str, size: usize) {
            let full = self.source.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(&full, vec![7u8; size]).unwrap();
            self.ledger.insert(path, "cams", size as u64).await.unwrap();
        }

        async fn admit(&self, max: u64) -> anyhow::Result<AdmissionReport> {
            admit_new_files(&self.ledger, &self.trees, self.staging.path(), max).await
        }

        async fn state(&self, path: &str) -> FileState {
            self.ledger.lookup(path, "cams").await.unwrap().unwrap().state
        }
    }

    #[tokio::test]
    async fn test_empty_ledger_admits_nothing() {
        let fx = fixture().await;
        let report = fx.admit(1000).await.unwrap();
        assert_eq!(report, AdmissionReport::default());
    }

    #[tokio::test]
    async fn test_stops_at_first_file_that_does_not_fit() {
        let fx = fixture().await;
        fx.discover("a.bin", 600).await;
        fx.discover("b.bin", 500).await;
        fx.discover("c.bin", 100).await;

        let report = fx.admit(1000).await.unwrap();

        assert_eq!(fx.state("a.bin").await, FileState::Queued);
        // c.bin would fit, but it may not overtake b.bin
        assert_eq!(fx.state("b.bin").await, FileState::New);
        assert_eq!(fx.state("c.bin").await, FileState::New);
        assert_eq!(report.queued, 1);
        assert_eq!(report.deferred, 2);
        assert_eq!(report.running_total, 600);
    }

    #[tokio::test]
    async fn test_oversized_file_is_skipped_and_pass_continues() {
        let fx = fixture().await;
        fx.discover("huge.bin", 2000).await;
        fx.discover("small.bin", 10).await;

        let report = fx.admit(1000).await.unwrap();

        assert_eq!(fx.state("huge.bin").await, FileState::Skipped);
        assert_eq!(fx.state("small.bin").await, FileState::Queued);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.queued, 1);

        // Skipped stays skipped on later passes
        fx.admit(1000).await.unwrap();
        assert_eq!(fx.state("huge.bin").await, FileState::Skipped);
    }

    #[tokio::test]
    async fn test_copies_into_tree_layout_and_records_path() {
        let fx = fixture().await;
        fx.discover("2024/01/clip.mp4", 42).await;

        fx.admit(1000).await.unwrap();

        let expected = fx.staging.path().join("cams/2024/01/clip.mp4");
        assert_eq!(fs::read(&expected).unwrap().len(), 42);
        let record = fx.ledger.lookup("2024/01/clip.mp4", "cams").await.unwrap().unwrap();
        assert_eq!(record.staging_path, Some(expected));
    }

    #[tokio::test]
    async fn test_completed_usage_counts_against_quota() {
        let fx = fixture().await;
        fx.discover("old.bin", 900).await;
        fx.admit(1000).await.unwrap();
        fx.ledger.mark_all_queued_completed().await.unwrap();

        fx.discover("next.bin", 200).await;
        let report = fx.admit(1000).await.unwrap();

        assert_eq!(fx.state("next.bin").await, FileState::New);
        assert_eq!(report.running_total, 900);
        assert_eq!(report.deferred, 1);
    }

    #[tokio::test]
    async fn test_admitted_bytes_never_exceed_quota() {
        let fx = fixture().await;
        for (i, size) in [300, 300, 300, 300].iter().enumerate() {
            fx.discover(&format!("{i}.bin"), *size).await;
        }

        let report = fx.admit(1000).await.unwrap();

        assert_eq!(report.queued, 3);
        assert_eq!(report.bytes_admitted, 900);
        assert!(report.running_total <= 1000);
    }

    #[tokio::test]
    async fn test_live_size_is_used() {
        let fx = fixture().await;
        fx.discover("grew.bin", 10).await;
        fs::write(fx.source.path().join("grew.bin"), vec![0u8; 2000]).unwrap();

        fx.admit(1000).await.unwrap();
        assert_eq!(fx.state("grew.bin").await, FileState::Skipped);
    }

    #[tokio::test]
    async fn test_vanished_source_is_left_new() {
        let fx = fixture().await;
        fx.discover("gone.bin", 10).await;
        fx.discover("here.bin", 10).await;
        fs::remove_file(fx.source.path().join("gone.bin")).unwrap();

        let report = fx.admit(1000).await.unwrap();

        assert_eq!(fx.state("gone.bin").await, FileState::New);
        assert_eq!(fx.state("here.bin").await, FileState::Queued);
        assert_eq!(report.unavailable, 1);
    }

    #[tokio::test]
    async fn test_staging_failure_is_fatal() {
        let fx = fixture().await;
        fx.discover("a.bin", 10).await;
        // A regular file where the tree directory should go
        fs::write(fx.staging.path().join("cams"), b"x").unwrap();

        let err = fx.admit(1000).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::StagingDir { .. })
        ));
        assert_eq!(fx.state("a.bin").await, FileState::New);
    }
}
