//! Sync loop
//!
//! The [`SyncEngine`] owns the directory watcher and drives the ledger, the
//! admission controller and the remote mirror in a fixed order.
//!
//! ## Startup
//!
//! 1. Scan every source tree into the ledger
//! 2. One transfer, whether or not anything is staged
//! 3. Register directory watches
//!
//! ## Cycle
//!
//! 1. **Discover**: rescan the trees the watcher reports as changed
//! 2. **Expire**: delete staged copies older than the retention window
//! 3. **Retry**: re-run the transfer if earlier ones failed; on failure stop here
//! 4. **Admit**: stage `new` files within the destination quota
//! 5. **Sync**: transfer if anything is queued or failed
//!
//! Cycles repeat every `poll_interval` until the shutdown token is cancelled.
//! Errors other than transfer failures end the loop.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quotasync_core::config::Config;
use quotasync_core::ports::{ILedger, IRemoteMirror, TransferOutcome};

use crate::admission::{admit_new_files, AdmissionReport};
use crate::scanner::scan_tree;
use crate::watcher::{DirectoryWatcher, WatchBackend};

// ============================================================================
// Settings and reports
// ============================================================================

/// The parts of [`Config`] the sync loop needs
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Source tree name -> root directory
    pub trees: BTreeMap<String, PathBuf>,
    /// Root of the staging area
    pub staging_root: PathBuf,
    /// Maximum bytes of completed files on the remote side
    pub dest_size_max: u64,
    /// How long a completed file stays staged after its last successful sync
    pub retention: Duration,
    /// Sleep between cycles
    pub poll_interval: Duration,
    /// Only expire staged files in cycles that have `new` files waiting
    pub expire_requires_new_files: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            trees: config.directories.clone(),
            staging_root: config.sync.temp_dir.clone(),
            dest_size_max: config.sync.dest_size_max,
            retention: config.retention(),
            poll_interval: config.poll_interval(),
            expire_requires_new_files: config.sync.expire_requires_new_files,
        }
    }
}

/// What a single cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Trees rescanned because the watcher reported changes
    pub changed_trees: Vec<String>,
    /// Records added to the ledger
    pub discovered: usize,
    /// Staged copies removed after the retention window
    pub expired: usize,
    /// Outcome of the retry transfer, if one was attempted
    pub retry: Option<TransferOutcome>,
    /// Admission results; `None` when a failed retry ended the cycle early
    pub admission: Option<AdmissionReport>,
    /// Outcome of the sync transfer, if one was attempted
    pub transfer: Option<TransferOutcome>,
}

// ============================================================================
// SyncEngine
// ============================================================================

/// Drives discovery, expiry, retry, admission and transfer
pub struct SyncEngine<B: WatchBackend> {
    ledger: Arc<dyn ILedger>,
    mirror: Arc<dyn IRemoteMirror>,
    watcher: DirectoryWatcher<B>,
    settings: EngineSettings,
}

impl<B: WatchBackend> SyncEngine<B> {
    pub fn new(
        ledger: Arc<dyn ILedger>,
        mirror: Arc<dyn IRemoteMirror>,
        watcher: DirectoryWatcher<B>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger,
            mirror,
            watcher,
            settings,
        }
    }

    /// Runs the startup sequence, then cycles until `shutdown` is cancelled
    ///
    /// Cancellation is observed between cycles and during the sleep; a cycle
    /// in progress always completes.
    ///
    /// # Errors
    /// Returns the first error that is not a transfer failure.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        self.initial_pass().await?;

        while !shutdown.is_cancelled() {
            self.run_cycle().await?;

            debug!(
                seconds = self.settings.poll_interval.as_secs(),
                "Sleeping until next cycle"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        info!("Sync loop stopped");
        Ok(())
    }

    /// Full scan of every tree, one unconditional transfer, then watch setup
    pub async fn initial_pass(&mut self) -> Result<()> {
        info!(trees = self.settings.trees.len(), "Starting initial scan");

        let mut discovered = 0;
        let names: Vec<String> = self.settings.trees.keys().cloned().collect();
        for tree in &names {
            discovered += self.discover_tree(tree).await?;
        }
        info!(discovered, "Initial scan finished");

        self.sync_staged(true).await?;

        self.watcher.configure(&self.settings.trees);
        info!(directories = self.watcher.watched_count(), "Directory watches attached");
        Ok(())
    }

    /// One iteration of the loop
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let changed = self.watcher.poll();
        if !changed.is_empty() {
            info!(trees = ?changed, "Files changed in watched directories");
            for tree in &changed {
                report.discovered += self.discover_tree(tree).await?;
            }
            report.changed_trees = changed.into_iter().collect();
        }

        report.expired = self.remove_expired().await?;

        report.retry = self.retry_failed().await?;
        match report.retry {
            Some(outcome) if !outcome.is_success() => {
                warn!("Retry of failed transfer failed again, postponing new files");
            }
            _ => {
                let admission = admit_new_files(
                    self.ledger.as_ref(),
                    &self.settings.trees,
                    &self.settings.staging_root,
                    self.settings.dest_size_max,
                )
                .await?;
                report.admission = Some(admission);
                report.transfer = self.sync_staged(false).await?;
            }
        }

        let counts = self.ledger.count_by_state().await?;
        debug!(?counts, "Ledger state after cycle");

        Ok(report)
    }

    /// Scans one tree and records files the ledger does not know yet
    async fn discover_tree(&self, tree: &str) -> Result<usize> {
        let Some(root) = self.settings.trees.get(tree).cloned() else {
            return Ok(0);
        };

        debug!(tree, root = %root.display(), "Scanning source tree");
        let files = tokio::task::spawn_blocking(move || scan_tree(&root))
            .await
            .context("Source scan task failed")?;

        let mut added = 0;
        for file in files {
            if self.ledger.lookup(&file.relative_path, tree).await?.is_some() {
                continue;
            }
            if self
                .ledger
                .insert(&file.relative_path, tree, file.size)
                .await?
            {
                added += 1;
            }
        }

        if added > 0 {
            info!(tree, added, "New files discovered");
        }
        Ok(added)
    }

    /// Deletes staged copies past the retention window and marks them `deleted`
    ///
    /// Staged copies that cannot be removed stay `completed` and are tried
    /// again next cycle.
    async fn remove_expired(&self) -> Result<usize> {
        if self.settings.expire_requires_new_files && !self.ledger.has_new().await? {
            return Ok(0);
        }

        let expired = self
            .ledger
            .list_expired_completed(self.settings.retention)
            .await?;

        let mut removed = 0;
        for path in expired {
            if !remove_staged_file(&path).await {
                continue;
            }
            self.ledger.mark_deleted(&path).await?;
            removed += 1;
        }

        if removed > 0 {
            info!(count = removed, "Removed expired files from staging");
        }
        Ok(removed)
    }

    /// Re-runs the transfer when earlier ones failed; `None` if nothing had failed
    async fn retry_failed(&self) -> Result<Option<TransferOutcome>> {
        if self.ledger.list_failed().await?.is_empty() {
            return Ok(None);
        }

        info!("Retrying previously failed transfer");
        let outcome = self.attempt_transfer().await;
        if outcome.is_success() {
            let count = self.ledger.mark_all_failed_completed().await?;
            info!(count, "Previously failed transfers synced");
        }
        Ok(Some(outcome))
    }

    /// Transfers the staging area if anything awaits transfer, or always when `force`
    async fn sync_staged(&self, force: bool) -> Result<Option<TransferOutcome>> {
        if !force && self.ledger.count_queued_or_failed().await? == 0 {
            debug!("Nothing to sync, skipping transfer");
            return Ok(None);
        }

        let outcome = self.attempt_transfer().await;
        if outcome.is_success() {
            let queued = self.ledger.mark_all_queued_completed().await?;
            let failed = self.ledger.mark_all_failed_completed().await?;
            info!(completed = queued + failed, "Transfer confirmed staged files");
        } else {
            let failed = self.ledger.mark_all_queued_failed().await?;
            if failed > 0 {
                warn!(count = failed, "Queued files marked failed");
            }
        }
        Ok(Some(outcome))
    }

    /// One mirror call; an error starting the transfer counts as a failure
    async fn attempt_transfer(&self) -> TransferOutcome {
        match self.mirror.mirror().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Transfer could not be started");
                TransferOutcome::Failed { exit_code: None }
            }
        }
    }
}

/// Removes a staged copy; returns false if it is still on disk
async fn remove_staged_file(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!(path = %path.display(), "Removing expired file");
            true
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "Expired file already gone");
            true
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove expired file");
            false
        }
    }
}
