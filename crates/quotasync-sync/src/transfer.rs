//! rsync-over-ssh implementation of IRemoteMirror
//!
//! Each attempt runs
//!
//! ```text
//! rsync --timeout=<t> -e "ssh -p <port>" --size-only -rl --delete -h --stats \
//!       <staging_root> <user>@<host>:<dest_folder>
//! ```
//!
//! and maps exit status zero to success. Files are compared by size only;
//! files missing from the staging area are deleted on the remote side.
//! After a successful transfer the optional post-sync command runs through
//! `sh -c`; its outcome is logged and never affects the transfer result.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, error, info, warn};

use quotasync_core::config::{Config, RemoteConfig};
use quotasync_core::ports::{IRemoteMirror, TransferOutcome};

use crate::SyncError;

const RSYNC_PROGRAM: &str = "rsync";

/// Mirrors the staging area to the remote host with `rsync`
#[derive(Debug, Clone)]
pub struct RsyncMirror {
    program: String,
    staging_root: PathBuf,
    remote: RemoteConfig,
    timeout: Duration,
    post_sync_command: Option<String>,
}

impl RsyncMirror {
    /// Builds the mirror from the `remote` and `sync` settings
    pub fn from_config(config: &Config) -> Self {
        Self {
            program: RSYNC_PROGRAM.to_string(),
            staging_root: config.sync.temp_dir.clone(),
            remote: config.remote.clone(),
            timeout: config.rsync_timeout(),
            post_sync_command: config.sync.post_sync_command.clone(),
        }
    }

    /// Replaces the transfer program, keeping the arguments
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Command-line arguments passed to the transfer program
    pub fn args(&self) -> Vec<String> {
        vec![
            format!("--timeout={}", self.timeout.as_secs()),
            "-e".to_string(),
            format!("ssh -p {}", self.remote.port),
            "--size-only".to_string(),
            "-rl".to_string(),
            "--delete".to_string(),
            "-h".to_string(),
            "--stats".to_string(),
            self.staging_root.display().to_string(),
            format!(
                "{}@{}:{}",
                self.remote.user, self.remote.host, self.remote.dest_folder
            ),
        ]
    }

    /// Runs the post-sync command, if any; failures are only logged
    async fn run_post_sync_command(&self) {
        let Some(command) = self.post_sync_command.as_deref() else {
            return;
        };

        debug!(command, "Executing post-sync command");
        match Command::new("sh").arg("-c").arg(command).output().await {
            Ok(output) => {
                log_output(&output, "post-sync command");
                if output.status.success() {
                    info!("Post-sync command execution successful");
                } else {
                    error!(
                        status = ?output.status.code(),
                        "Post-sync command execution failed"
                    );
                }
            }
            Err(e) => {
                let err = SyncError::Spawn {
                    program: "sh".to_string(),
                    source: e,
                };
                error!(error = %err, "Post-sync command could not be started");
            }
        }
    }
}

/// Logs captured stdout at info and stderr at warn, one event per stream
fn log_output(output: &Output, what: &str) {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim_end();
    if !stdout.is_empty() {
        info!(source = what, "{stdout}");
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim_end();
    if !stderr.is_empty() {
        warn!(source = what, "{stderr}");
    }
}

#[async_trait::async_trait]
impl IRemoteMirror for RsyncMirror {
    async fn mirror(&self) -> anyhow::Result<TransferOutcome> {
        let args = self.args();
        debug!(program = %self.program, args = ?args, "Starting transfer");

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SyncError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        log_output(&output, &self.program);

        if output.status.success() {
            info!("Sync successful");
            self.run_post_sync_command().await;
            Ok(TransferOutcome::Succeeded)
        } else {
            let outcome = TransferOutcome::Failed {
                exit_code: output.status.code(),
            };
            error!(outcome = %outcome, "Sync failed");
            Ok(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quotasync_core::config::ConfigBuilder;
    use std::path::Path;
    use tempfile::TempDir;

    fn config(staging: &Path) -> ConfigBuilder {
        ConfigBuilder::new()
            .remote("backup", "nas.example.com", 2222, "/volume1/offload")
            .temp_dir(staging.to_path_buf())
            .rsync_timeout(120)
    }

    #[test]
    fn test_args_match_rsync_invocation() {
        let mirror = RsyncMirror::from_config(&config(Path::new("/var/spool/qs")).build());
        assert_eq!(
            mirror.args(),
            vec![
                "--timeout=120",
                "-e",
                "ssh -p 2222",
                "--size-only",
                "-rl",
                "--delete",
                "-h",
                "--stats",
                "/var/spool/qs",
                "backup@nas.example.com:/volume1/offload",
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_exit_is_success_and_runs_hook() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("hook-ran");
        let cfg = config(tmp.path())
            .post_sync_command(format!("touch '{}'", marker.display()))
            .build();
        let mirror = RsyncMirror::from_config(&cfg).with_program("true");

        assert_eq!(mirror.mirror().await.unwrap(), TransferOutcome::Succeeded);
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failure_and_skips_hook() {
        let tmp = TempDir::new().unwrap();
        let marker = tmp.path().join("hook-ran");
        let cfg = config(tmp.path())
            .post_sync_command(format!("touch '{}'", marker.display()))
            .build();
        let mirror = RsyncMirror::from_config(&cfg).with_program("false");

        assert_eq!(
            mirror.mirror().await.unwrap(),
            TransferOutcome::Failed { exit_code: Some(1) }
        );
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_failing_hook_does_not_fail_transfer() {
        let tmp = TempDir::new().unwrap();
        let cfg = config(tmp.path()).post_sync_command("exit 3").build();
        let mirror = RsyncMirror::from_config(&cfg).with_program("true");

        assert!(mirror.mirror().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mirror = RsyncMirror::from_config(&config(tmp.path()).build())
            .with_program("/nonexistent/quotasync-rsync");

        let err = mirror.mirror().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Spawn { .. })
        ));
    }
}
