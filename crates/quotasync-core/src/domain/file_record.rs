//! FileRecord domain entity
//!
//! A [`FileRecord`] is the unit the ledger tracks: one file discovered under a
//! named source tree, plus where it is in its transfer lifecycle.
//!
//! ## State Machine
//!
//! ```text
//!   ┌─────┐  admitted   ┌────────┐  transfer ok   ┌───────────┐  retention   ┌─────────┐
//!   │ New │ ──────────► │ Queued │ ─────────────► │ Completed │ ───────────► │ Deleted │
//!   └─────┘             └────────┘                └───────────┘   elapsed    └─────────┘
//!      │                     │                          ▲
//!      │ larger than quota   │ transfer failed          │ retry ok
//!      ▼                     ▼                          │
//!  ┌─────────┐          ┌────────┐ ─────────────────────┘
//!  │ Skipped │          │ Failed │ ◄──┐
//!  └─────────┘          └────────┘ ───┘ retry failed
//! ```
//!
//! `Skipped` and `Deleted` are terminal.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

// ============================================================================
// FileState
// ============================================================================

/// Transfer state of a ledger record
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Discovered, not yet staged
    #[default]
    New,
    /// Copied into the staging area, waiting for a transfer
    Queued,
    /// Confirmed on the remote side by a successful transfer
    Completed,
    /// The transfer that carried it failed; retried every cycle
    Failed,
    /// Larger than the whole remote quota; never transferred
    Skipped,
    /// Staging copy expired and removed; kept as history
    Deleted,
}

impl FileState {
    /// All states, in lifecycle order
    pub const ALL: [FileState; 6] = [
        FileState::New,
        FileState::Queued,
        FileState::Completed,
        FileState::Failed,
        FileState::Skipped,
        FileState::Deleted,
    ];

    /// The name stored in the ledger's `state` column
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::New => "new",
            FileState::Queued => "queued",
            FileState::Completed => "completed",
            FileState::Failed => "failed",
            FileState::Skipped => "skipped",
            FileState::Deleted => "deleted",
        }
    }

    /// Returns true if the file sits in the staging area waiting for a transfer
    pub fn awaits_transfer(&self) -> bool {
        matches!(self, FileState::Queued | FileState::Failed)
    }

    /// Returns true if `self -> target` is an edge of the state machine
    ///
    /// `Failed -> Failed` is allowed: a failed retry leaves the record as is.
    pub fn can_transition_to(&self, target: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, target),
            (New, Queued)
                | (New, Skipped)
                | (Queued, Completed)
                | (Queued, Failed)
                | (Failed, Completed)
                | (Failed, Failed)
                | (Completed, Deleted)
        )
    }

    /// Checks a transition, returning [`DomainError::InvalidState`] if it is not allowed
    pub fn transition_to(&self, target: FileState) -> Result<FileState, DomainError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(DomainError::InvalidState {
                from: self.to_string(),
                to: target.to_string(),
            })
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(FileState::New),
            "queued" => Ok(FileState::Queued),
            "completed" => Ok(FileState::Completed),
            "failed" => Ok(FileState::Failed),
            "skipped" => Ok(FileState::Skipped),
            "deleted" => Ok(FileState::Deleted),
            other => Err(DomainError::UnknownState(other.to_string())),
        }
    }
}

// ============================================================================
// RecordKey
// ============================================================================

/// Natural key of a ledger record: `(path, source tree name)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Path relative to the source tree root, `/`-separated
    pub path: String,
    /// Name of the configured source tree
    pub tree: String,
}

impl RecordKey {
    /// Builds a key, rejecting paths that are absolute or leave the tree
    pub fn new(path: impl Into<String>, tree: impl Into<String>) -> Result<Self, DomainError> {
        let path = path.into();
        validate_relative_path(&path)?;
        Ok(Self {
            path,
            tree: tree.into(),
        })
    }

    /// Where this file lives once admitted: `<staging_root>/<tree>/<path>`
    pub fn staging_path(&self, staging_root: &Path) -> PathBuf {
        staging_root.join(&self.tree).join(&self.path)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tree, self.path)
    }
}

/// Validates that `path` is a non-empty relative path made of plain components
pub fn validate_relative_path(path: &str) -> Result<(), DomainError> {
    if path.is_empty() {
        return Err(DomainError::InvalidPath("path is empty".to_string()));
    }
    let all_normal = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !all_normal {
        return Err(DomainError::InvalidPath(path.to_string()));
    }
    Ok(())
}

// ============================================================================
// FileRecord
// ============================================================================

/// One file tracked by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the source tree root
    pub path: String,
    /// Name of the source tree the file belongs to
    pub tree: String,
    /// Size in bytes captured at discovery time
    pub size: u64,
    /// Current transfer state
    pub state: FileState,
    /// Absolute path of the staging copy, set on admission
    pub staging_path: Option<PathBuf>,
    /// When the file was first discovered
    pub created_at: DateTime<Utc>,
    /// When a transfer last confirmed the file on the remote side
    pub synced_at: Option<DateTime<Utc>>,
}

impl FileRecord {
    /// Returns the record's natural key
    ///
    /// # Errors
    /// Returns [`DomainError::InvalidPath`] if the stored path is not a clean
    /// relative path.
    pub fn key(&self) -> Result<RecordKey, DomainError> {
        RecordKey::new(self.path.clone(), self.tree.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrips_through_column_name() {
        for state in FileState::ALL {
            assert_eq!(state.as_str().parse::<FileState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        let err = "pending".parse::<FileState>().unwrap_err();
        assert_eq!(err, DomainError::UnknownState("pending".to_string()));
    }

    #[test]
    fn test_terminal_states() {
        for target in FileState::ALL {
            assert!(!FileState::Skipped.can_transition_to(target));
            assert!(!FileState::Deleted.can_transition_to(target));
        }
    }

    #[test]
    fn test_allowed_transitions() {
        assert!(FileState::New.can_transition_to(FileState::Queued));
        assert!(FileState::New.can_transition_to(FileState::Skipped));
        assert!(FileState::Queued.can_transition_to(FileState::Failed));
        assert!(FileState::Failed.can_transition_to(FileState::Failed));
        assert!(FileState::Failed.can_transition_to(FileState::Completed));
        assert!(FileState::Completed.can_transition_to(FileState::Deleted));

        assert!(!FileState::New.can_transition_to(FileState::Completed));
        assert!(!FileState::Queued.can_transition_to(FileState::Deleted));
        assert!(!FileState::Completed.can_transition_to(FileState::Failed));
    }

    #[test]
    fn test_transition_to_reports_edge() {
        let err = FileState::Skipped
            .transition_to(FileState::Queued)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition from skipped to queued"
        );
        assert_eq!(
            FileState::New.transition_to(FileState::Queued),
            Ok(FileState::Queued)
        );
    }

    #[test]
    fn test_awaits_transfer() {
        assert!(FileState::Queued.awaits_transfer());
        assert!(FileState::Failed.awaits_transfer());
        assert!(!FileState::New.awaits_transfer());
        assert!(!FileState::Completed.awaits_transfer());
    }

    #[test]
    fn test_record_key_rejects_escaping_paths() {
        assert!(RecordKey::new("a/b.mp4", "cams").is_ok());
        assert!(RecordKey::new("", "cams").is_err());
        assert!(RecordKey::new("/etc/passwd", "cams").is_err());
        assert!(RecordKey::new("../up.mp4", "cams").is_err());
        assert!(RecordKey::new("a/../../b", "cams").is_err());
    }

    #[test]
    fn test_staging_path_layout() {
        let key = RecordKey::new("2024/01/clip.mp4", "cams").unwrap();
        assert_eq!(
            key.staging_path(Path::new("/var/spool/qs")),
            PathBuf::from("/var/spool/qs/cams/2024/01/clip.mp4")
        );
        assert_eq!(key.to_string(), "cams:2024/01/clip.mp4");
    }
}
