//! Remote mirror port (driven/secondary port)
//!
//! One call to [`IRemoteMirror::mirror`] is one transfer attempt: the whole
//! staging area is mirrored to the remote destination, with files absent
//! from staging removed remotely. The outcome covers every staged file at
//! once.

use std::fmt;

/// Result of a single transfer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The transfer tool exited with status zero
    Succeeded,
    /// The transfer tool exited non-zero or was killed by a signal
    Failed {
        /// Exit status, `None` when terminated by a signal
        exit_code: Option<i32>,
    },
}

impl TransferOutcome {
    /// Returns true for [`TransferOutcome::Succeeded`]
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Succeeded)
    }
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Succeeded => write!(f, "succeeded"),
            TransferOutcome::Failed {
                exit_code: Some(code),
            } => write!(f, "failed (exit status {code})"),
            TransferOutcome::Failed { exit_code: None } => {
                write!(f, "failed (terminated by signal)")
            }
        }
    }
}

/// Port trait for the external transfer mechanism
///
/// `Err` means the attempt could not be made at all (e.g. the tool could not
/// be spawned); callers treat it like a failed transfer.
#[async_trait::async_trait]
pub trait IRemoteMirror: Send + Sync {
    /// Mirrors the staging area to the remote destination once
    async fn mirror(&self) -> anyhow::Result<TransferOutcome>;
}
