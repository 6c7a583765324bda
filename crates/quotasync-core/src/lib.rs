//! QuotaSync Core - Domain types, settings and ports
//!
//! This crate contains the parts of QuotaSync that carry no I/O of their own:
//! - **Domain** - `FileRecord`, the `FileState` transfer state machine, domain errors
//! - **Settings** - the typed YAML configuration with validation and defaults
//! - **Ports** - traits for the file ledger (`ILedger`) and the remote mirror
//!   (`IRemoteMirror`), implemented by adapter crates
//!
//! # Architecture
//!
//! Same ports & adapters split as the rest of the workspace: the sync engine
//! in `quotasync-sync` depends only on the ports defined here, the SQLite
//! ledger lives in `quotasync-cache`, and the rsync adapter lives next to the
//! engine.

pub mod config;
pub mod domain;
pub mod ports;
