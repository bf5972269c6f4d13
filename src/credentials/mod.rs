//! Credential Synchronizer
//!
//! The pooling layer authenticates clients against its own copy of `(username, secretHash)`
//! pairs. This module owns that copy: its grammar ([`cache`]), structural repair ([`repair`]),
//! the file on disk ([`file`]) and the [`CredentialSynchronizer`] that converges it to the
//! primary store.

pub mod cache;
pub mod errors;
pub mod file;
pub mod repair;
pub mod synchronizer;

pub use cache::{CacheDocument, CacheEntry, CacheLine, EntryChange};
pub use errors::{CacheError, SyncError};
pub use file::CacheFile;
pub use repair::{Finding, FindingAction, Fix, Inspection, QuarantineReason, inspect};
pub use synchronizer::{
    CredentialSynchronizer, ReloadOutcome, RepairReport, SyncAction, SyncOneReport, SyncReport,
};
