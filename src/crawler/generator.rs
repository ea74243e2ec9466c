//! Work generation
//!
//! The generator walks the committed snapshot in key order, a page at a
//! time, and hands out the datums that pass its filter until the snapshot
//! is exhausted or the per-iteration limit is reached.

use crate::state::CrawlDatum;
use crate::storage::{acquire, SharedBackend, StorageBackend, StorageResult};
use std::collections::VecDeque;
use std::sync::Arc;

/// Datums read from the backend per page
pub const DEFAULT_PAGE_SIZE: usize = 256;

/// Decides whether a committed datum is offered for fetching
pub trait GeneratorFilter: Send + Sync {
    /// Returns the datum to offer (possibly rewritten), or `None` to skip it
    fn filter(&self, datum: CrawlDatum) -> Option<CrawlDatum>;
}

impl<F: GeneratorFilter + ?Sized> GeneratorFilter for Arc<F> {
    fn filter(&self, datum: CrawlDatum) -> Option<CrawlDatum> {
        (**self).filter(datum)
    }
}

/// Offers only datums in a fetchable status (unfetched or retry)
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusFilter;

impl GeneratorFilter for StatusFilter {
    fn filter(&self, datum: CrawlDatum) -> Option<CrawlDatum> {
        datum.status.is_fetchable().then_some(datum)
    }
}

/// Skips datums that failed more than `max_retry` times
#[derive(Debug, Clone, Copy)]
pub struct RetryFilter {
    pub max_retry: u32,
}

impl GeneratorFilter for RetryFilter {
    fn filter(&self, datum: CrawlDatum) -> Option<CrawlDatum> {
        (datum.retry <= self.max_retry).then_some(datum)
    }
}

/// Skips datums attempted more than `max_execute_count` times
#[derive(Debug, Clone, Copy)]
pub struct ExecuteCountFilter {
    pub max_execute_count: Option<u32>,
}

impl GeneratorFilter for ExecuteCountFilter {
    fn filter(&self, datum: CrawlDatum) -> Option<CrawlDatum> {
        match self.max_execute_count {
            Some(max) if datum.execute_count > max => None,
            _ => Some(datum),
        }
    }
}

/// Applies filters in order; the first one to skip a datum wins
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn GeneratorFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard chain: status, then retry limit, then execution limit
    pub fn standard(max_retry: u32, max_execute_count: Option<u32>) -> Self {
        Self::new()
            .with(StatusFilter)
            .with(RetryFilter { max_retry })
            .with(ExecuteCountFilter { max_execute_count })
    }

    pub fn with(mut self, filter: impl GeneratorFilter + 'static) -> Self {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl GeneratorFilter for FilterChain {
    fn filter(&self, datum: CrawlDatum) -> Option<CrawlDatum> {
        self.filters
            .iter()
            .try_fold(datum, |datum, filter| filter.filter(datum))
    }
}

/// Counters of one generation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerateStats {
    /// Datums read from the snapshot
    pub scanned: u64,

    /// Datums handed out
    pub generated: u64,

    /// Datums rejected by the filter
    pub skipped: u64,
}

/// A bounded, filtered cursor over the committed snapshot
pub struct Generator<B> {
    backend: SharedBackend<B>,
    filter: Box<dyn GeneratorFilter>,
    top_n: Option<usize>,
    page_size: usize,
    buffer: VecDeque<CrawlDatum>,
    after: Option<String>,
    drained: bool,
    stats: GenerateStats,
}

impl<B: StorageBackend> Generator<B> {
    /// Creates a cursor positioned before the first key
    ///
    /// `top_n` caps the number of datums handed out (`None` is unbounded).
    pub fn new(
        backend: SharedBackend<B>,
        filter: impl GeneratorFilter + 'static,
        top_n: Option<usize>,
    ) -> Self {
        Self {
            backend,
            filter: Box::new(filter),
            top_n,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
            after: None,
            drained: false,
            stats: GenerateStats::default(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Returns the next eligible datum, or `None` when exhausted
    pub fn next(&mut self) -> StorageResult<Option<CrawlDatum>> {
        loop {
            if self
                .top_n
                .is_some_and(|limit| self.stats.generated >= limit as u64)
            {
                return Ok(None);
            }

            let datum = match self.buffer.pop_front() {
                Some(datum) => datum,
                None if self.drained => return Ok(None),
                None => {
                    self.fill()?;
                    continue;
                }
            };

            self.stats.scanned += 1;
            match self.filter.filter(datum) {
                Some(datum) => {
                    self.stats.generated += 1;
                    return Ok(Some(datum));
                }
                None => self.stats.skipped += 1,
            }
        }
    }

    /// Number of datums handed out so far
    pub fn total_generated(&self) -> u64 {
        self.stats.generated
    }

    pub fn stats(&self) -> GenerateStats {
        self.stats
    }

    fn fill(&mut self) -> StorageResult<()> {
        let page = acquire(&self.backend)?.scan(self.after.as_deref(), self.page_size)?;
        if page.len() < self.page_size {
            self.drained = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(last.key.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}
