//! Domain error types
//!
//! Errors raised while validating ledger data: unknown state names coming back
//! from storage, relative paths that would escape their tree, and rejected
//! state transitions.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A stored state string did not name a known state
    #[error("Unknown file state: {0}")]
    UnknownState(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },
}
