//! Storage module for the crawl database
//!
//! This module holds everything that persists crawl state:
//! - The `StorageBackend` trait every backend implements
//! - The SQLite reference backend and an in-memory backend
//! - Segment naming and the merge conflict resolver shared by all backends
//! - The advisory lock record used to detect unclean shutdowns

mod memory;
mod merge;
mod schema;
mod segment;
mod sqlite;
mod traits;

pub use memory::MemoryBackend;
pub use merge::{resolve, Candidate, MergeStats, Resolution};
pub use segment::SegmentName;
pub use sqlite::SqliteBackend;
pub use traits::{StorageBackend, StorageError, StorageResult};

use crate::state::Status;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// A backend shared between the coordinator and the fetch workers
pub type SharedBackend<B> = Arc<Mutex<B>>;

/// Wraps a backend for sharing
pub fn share<B: StorageBackend>(backend: B) -> SharedBackend<B> {
    Arc::new(Mutex::new(backend))
}

/// Locks a shared backend, turning a poisoned mutex into a storage error
pub fn acquire<B: StorageBackend>(backend: &SharedBackend<B>) -> StorageResult<MutexGuard<'_, B>> {
    backend.lock().map_err(|_| StorageError::Poisoned)
}

/// The persisted advisory lock of a crawl database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRecord {
    /// True while a run holds the database
    pub locked: bool,

    /// When the lock was last taken
    pub locked_at: Option<DateTime<Utc>>,

    /// Hash of the configuration used by the run that took the lock
    pub config_hash: Option<String>,
}

/// Inspection counters of a crawl database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Committed datums per status
    pub by_status: BTreeMap<Status, u64>,

    /// Fetchable datums that ran out of retries or executions
    pub given_up: u64,

    pub pending_segments: usize,
    pub pending_injections: u64,
    pub lock: LockRecord,
}

impl BackendStats {
    /// Total committed datums
    pub fn total(&self) -> u64 {
        self.by_status.values().sum()
    }

    pub fn count(&self, status: Status) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}
