//! Storage traits and error types
//!
//! This module defines the trait interface every crawl database backend
//! implements, along with the associated error types.

use crate::state::{CrawlDatum, Status};
use crate::storage::{BackendStats, LockRecord, MergeStats, SegmentName};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Backend is not open")]
    Closed,

    #[error("No segment writer is open")]
    NoSegmentWriter,

    #[error("Segment writer {0} is still open")]
    SegmentWriterOpen(SegmentName),

    #[error("Corrupt record for key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Storage lock poisoned")]
    Poisoned,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for crawl database backends
///
/// A backend holds the committed snapshot (one datum per key), the pending
/// injection requests, the not-yet-merged segments and the lock record.
/// Workers never modify the snapshot directly: they append to the open
/// segment, and `merge` folds segments and injections into a new snapshot
/// that replaces the current one in a single atomic step.
///
/// Every backend must behave identically; `tests/backend_conformance.rs`
/// runs the same property suite against each implementation.
pub trait StorageBackend: Send {
    /// Short name used in log output
    fn name(&self) -> &'static str;

    // ===== Lifecycle =====

    /// Acquires backend resources, creating the database if needed
    fn open(&mut self) -> StorageResult<()>;

    /// Releases backend resources. Closing a closed backend is a no-op.
    fn close(&mut self) -> StorageResult<()>;

    fn is_open(&self) -> bool;

    /// Returns true if a crawl database already exists at this location
    fn is_db_exists(&self) -> bool;

    /// Destroys the crawl database, including segments and the lock record
    fn clear(&mut self) -> StorageResult<()>;

    // ===== Injection =====

    /// Stages `datum` for the next merge
    ///
    /// Without `force` the request is dropped when the key is already known
    /// (committed or staged). With `force` the key will be reset to
    /// unfetched by the next merge regardless of its current state.
    ///
    /// Returns true if the request was staged.
    fn inject(&mut self, datum: &CrawlDatum, force: bool) -> StorageResult<bool>;

    /// Stages several datums; returns how many were staged
    fn inject_all(&mut self, datums: &[CrawlDatum], force: bool) -> StorageResult<usize> {
        let mut staged = 0;
        for datum in datums {
            if self.inject(datum, force)? {
                staged += 1;
            }
        }
        Ok(staged)
    }

    // ===== Lock =====

    /// Marks the database as in use by a run
    fn lock(&mut self, config_hash: Option<&str>) -> StorageResult<()>;

    /// Marks the database as cleanly released
    fn unlock(&mut self) -> StorageResult<()>;

    /// Reads the lock record
    fn lock_record(&self) -> StorageResult<LockRecord>;

    fn is_locked(&self) -> StorageResult<bool> {
        Ok(self.lock_record()?.locked)
    }

    // ===== Snapshot reads =====

    /// Point lookup in the committed snapshot
    fn get(&self, key: &str) -> StorageResult<Option<CrawlDatum>>;

    /// Returns up to `limit` datums with keys strictly greater than `after`,
    /// in ascending key order
    fn scan(&self, after: Option<&str>, limit: usize) -> StorageResult<Vec<CrawlDatum>>;

    /// Counts committed datums by status
    fn count_by_status(&self) -> StorageResult<BTreeMap<Status, u64>>;

    /// Counts fetchable datums that have run out of retries or executions
    fn count_given_up(&self, max_retry: u32, max_execute_count: Option<u32>) -> StorageResult<u64>;

    /// Number of staged injection requests
    fn count_pending_injections(&self) -> StorageResult<u64>;

    /// Collects the inspection counters in one report
    fn stats(&self, max_retry: u32, max_execute_count: Option<u32>) -> StorageResult<BackendStats> {
        Ok(BackendStats {
            by_status: self.count_by_status()?,
            given_up: self.count_given_up(max_retry, max_execute_count)?,
            pending_segments: self.pending_segments()?.len(),
            pending_injections: self.count_pending_injections()?,
            lock: self.lock_record()?,
        })
    }

    // ===== Segments =====

    /// Starts a new segment and makes it the write target
    fn init_segment_writer(&mut self) -> StorageResult<SegmentName>;

    /// Appends the outcome of one fetch attempt to the open segment
    fn write_fetch_segment(&mut self, datum: &CrawlDatum) -> StorageResult<()>;

    /// Appends discovered outlinks to the open segment
    fn write_parse_segment(&mut self, datums: &[CrawlDatum]) -> StorageResult<()>;

    /// Closes the open segment. Closing when no writer is open is a no-op.
    fn close_segment_writer(&mut self) -> StorageResult<()>;

    /// Names of segments that have not been merged yet, oldest first
    fn pending_segments(&self) -> StorageResult<Vec<SegmentName>>;

    // ===== Merge =====

    /// Folds all pending segments and injections into a new snapshot and
    /// installs it as current
    ///
    /// Either the whole merge is committed or nothing changes.
    fn merge(&mut self) -> StorageResult<MergeStats>;
}
