//! Domain entities and business logic
//!
//! - [`FileRecord`] - one discovered file and its transfer lifecycle
//! - [`FileState`] - the ledger state machine
//! - [`DomainError`] - domain-specific error types

pub mod errors;
pub mod file_record;

pub use errors::DomainError;
pub use file_record::{FileRecord, FileState, RecordKey};
