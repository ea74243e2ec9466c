//! In-memory storage implementation
//!
//! Keeps the whole crawl database in ordered maps. State survives
//! `close`/`open` within the process but is lost when the backend is
//! dropped. Useful for tests and for one-shot crawls that never resume.

use crate::state::{CrawlDatum, Injection, Status};
use crate::storage::merge::{resolve, Candidate, MergeStats};
use crate::storage::traits::{StorageBackend, StorageError, StorageResult};
use crate::storage::{LockRecord, SegmentName};
use chrono::Utc;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Segment {
    fetch: BTreeMap<String, CrawlDatum>,
    parse: BTreeMap<String, CrawlDatum>,
}

/// In-memory storage backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    open: bool,
    exists: bool,
    current: BTreeMap<String, CrawlDatum>,
    backup: BTreeMap<String, CrawlDatum>,
    segments: BTreeMap<SegmentName, Segment>,
    injections: BTreeMap<String, (Injection, CrawlDatum)>,
    writer: Option<SegmentName>,
    lock: LockRecord,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The snapshot replaced by the last merge
    pub fn backup(&self) -> impl Iterator<Item = &CrawlDatum> {
        self.backup.values()
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::Closed)
        }
    }

    fn open_segment(&mut self) -> StorageResult<&mut Segment> {
        self.ensure_open()?;
        let name = self.writer.as_ref().ok_or(StorageError::NoSegmentWriter)?;
        self.segments
            .get_mut(name)
            .ok_or_else(|| StorageError::Database(format!("segment {} vanished", name)))
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open(&mut self) -> StorageResult<()> {
        self.open = true;
        self.exists = true;
        Ok(())
    }

    fn close(&mut self) -> StorageResult<()> {
        self.writer = None;
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn is_db_exists(&self) -> bool {
        self.exists
    }

    fn clear(&mut self) -> StorageResult<()> {
        *self = Self::default();
        Ok(())
    }

    fn inject(&mut self, datum: &CrawlDatum, force: bool) -> StorageResult<bool> {
        self.ensure_open()?;
        if !force && (self.current.contains_key(&datum.key) || self.injections.contains_key(&datum.key))
        {
            return Ok(false);
        }
        self.injections.insert(
            datum.key.clone(),
            (Injection::from_force(force), datum.clone()),
        );
        Ok(true)
    }

    fn lock(&mut self, config_hash: Option<&str>) -> StorageResult<()> {
        self.ensure_open()?;
        self.lock = LockRecord {
            locked: true,
            locked_at: Some(Utc::now()),
            config_hash: config_hash.map(str::to_string),
        };
        Ok(())
    }

    fn unlock(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.lock.locked = false;
        Ok(())
    }

    fn lock_record(&self) -> StorageResult<LockRecord> {
        self.ensure_open()?;
        Ok(self.lock.clone())
    }

    fn get(&self, key: &str) -> StorageResult<Option<CrawlDatum>> {
        self.ensure_open()?;
        Ok(self.current.get(key).cloned())
    }

    fn scan(&self, after: Option<&str>, limit: usize) -> StorageResult<Vec<CrawlDatum>> {
        use std::ops::Bound;

        self.ensure_open()?;
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };
        Ok(self
            .current
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, datum)| datum.clone())
            .collect())
    }

    fn count_by_status(&self) -> StorageResult<BTreeMap<Status, u64>> {
        self.ensure_open()?;
        let mut counts = BTreeMap::new();
        for datum in self.current.values() {
            *counts.entry(datum.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn count_given_up(&self, max_retry: u32, max_execute_count: Option<u32>) -> StorageResult<u64> {
        self.ensure_open()?;
        Ok(self
            .current
            .values()
            .filter(|d| d.status.is_fetchable())
            .filter(|d| d.retry > max_retry || max_execute_count.is_some_and(|max| d.execute_count > max))
            .count() as u64)
    }

    fn count_pending_injections(&self) -> StorageResult<u64> {
        self.ensure_open()?;
        Ok(self.injections.len() as u64)
    }

    fn init_segment_writer(&mut self) -> StorageResult<SegmentName> {
        self.ensure_open()?;
        if let Some(open) = &self.writer {
            return Err(StorageError::SegmentWriterOpen(open.clone()));
        }
        let name = SegmentName::next(Utc::now(), self.segments.keys().next_back());
        self.segments.insert(name.clone(), Segment::default());
        self.writer = Some(name.clone());
        Ok(name)
    }

    fn write_fetch_segment(&mut self, datum: &CrawlDatum) -> StorageResult<()> {
        let segment = self.open_segment()?;
        segment.fetch.insert(datum.key.clone(), datum.clone());
        Ok(())
    }

    fn write_parse_segment(&mut self, datums: &[CrawlDatum]) -> StorageResult<()> {
        let segment = self.open_segment()?;
        for datum in datums {
            segment.parse.insert(datum.key.clone(), datum.clone());
        }
        Ok(())
    }

    fn close_segment_writer(&mut self) -> StorageResult<()> {
        self.writer = None;
        Ok(())
    }

    fn pending_segments(&self) -> StorageResult<Vec<SegmentName>> {
        self.ensure_open()?;
        Ok(self.segments.keys().cloned().collect())
    }

    fn merge(&mut self) -> StorageResult<MergeStats> {
        self.ensure_open()?;
        if let Some(open) = &self.writer {
            return Err(StorageError::SegmentWriterOpen(open.clone()));
        }

        let mut stats = MergeStats {
            segments: self.segments.len(),
            ..MergeStats::default()
        };

        // Same candidate order as the SQLite backend: snapshot, segments by
        // name with parse output before fetch output, then injections.
        let mut groups: BTreeMap<&str, Vec<Candidate>> = BTreeMap::new();
        for segment in self.segments.values() {
            for datum in segment.parse.values().chain(segment.fetch.values()) {
                groups
                    .entry(datum.key.as_str())
                    .or_default()
                    .push(Candidate::observed(datum.clone()));
                stats.candidates += 1;
            }
        }
        for (injection, datum) in self.injections.values() {
            groups
                .entry(datum.key.as_str())
                .or_default()
                .push(Candidate::requested(datum.clone(), *injection));
            stats.candidates += 1;
        }

        let mut next = BTreeMap::new();
        for (key, previous) in &self.current {
            let mut candidates = vec![Candidate::observed(previous.clone())];
            candidates.extend(groups.remove(key.as_str()).unwrap_or_default());
            if let Some(resolution) = resolve(candidates) {
                stats.record(&resolution, Some(previous));
                next.insert(key.clone(), resolution.datum);
            }
        }
        for (key, candidates) in groups {
            if let Some(resolution) = resolve(candidates) {
                stats.record(&resolution, None);
                next.insert(key.to_string(), resolution.datum);
            }
        }

        self.backup = std::mem::replace(&mut self.current, next);
        self.segments.clear();
        self.injections.clear();

        tracing::info!(
            "Merged {} segment(s): {} keys ({} new, {} updated, {} forced)",
            stats.segments,
            stats.total_keys,
            stats.new_keys,
            stats.updated_keys,
            stats.forced
        );
        Ok(stats)
    }
}
