//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the sync engine depends on; their implementations
//! live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ILedger`] - Durable per-file transfer state
//! - [`IRemoteMirror`] - Mirrors the staging area to the remote destination

pub mod ledger;
pub mod remote_mirror;

pub use ledger::{ILedger, StateCounts};
pub use remote_mirror::{IRemoteMirror, TransferOutcome};
