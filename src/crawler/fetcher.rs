//! Fetch worker pool
//!
//! This module runs one fetch round:
//! - A fixed number of workers pull datums from a shared generator
//! - Dispatches are spaced by the configured execute interval
//! - Each attempt is recorded in the fetch segment, outlinks in the parse segment
//! - A stop request ends the round once dispatched work has completed

use crate::crawler::generator::{GenerateStats, Generator};
use crate::crawler::visitor::{FetchError, NextFilter, Visitor};
use crate::state::{CrawlDatum, Status, META_KEY_DEPTH, META_KEY_REFERRER};
use crate::storage::{acquire, SharedBackend, StorageBackend, StorageError};
use crate::CrawlError;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::ops::AddAssign;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Outcome counters of one fetch round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Attempts made
    pub attempted: u64,

    /// Pages fetched and visited
    pub success: u64,

    /// Redirects recorded as fetched
    pub redirected: u64,

    /// Transient failures
    pub retried: u64,

    /// Permanent failures
    pub gone: u64,

    /// Outlinks written to the parse segment
    pub outlinks: u64,
}

impl AddAssign for FetchStats {
    fn add_assign(&mut self, other: Self) {
        self.attempted += other.attempted;
        self.success += other.success;
        self.redirected += other.redirected;
        self.retried += other.retried;
        self.gone += other.gone;
        self.outlinks += other.outlinks;
    }
}

/// Result of a completed fetch round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundStats {
    pub generate: GenerateStats,
    pub fetch: FetchStats,
}

/// Spaces dispatches across all workers of a pool
struct Pacer {
    interval: Duration,
    last_dispatch: Mutex<Option<Instant>>,
}

impl Pacer {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Waits until `interval` has passed since the previous dispatch
    async fn wait(&self) {
        if self.interval.is_zero() {
            return;
        }
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

struct Shared<B, V> {
    backend: SharedBackend<B>,
    generator: Mutex<Generator<B>>,
    visitor: Arc<V>,
    next_filter: Option<Arc<dyn NextFilter>>,
    pacer: Pacer,
    stop: CancellationToken,
}

/// A bounded pool of fetch workers
pub struct Fetcher<B, V> {
    backend: SharedBackend<B>,
    visitor: Arc<V>,
    next_filter: Option<Arc<dyn NextFilter>>,
    threads: usize,
    execute_interval: Duration,
    stop: CancellationToken,
}

impl<B, V> Fetcher<B, V>
where
    B: StorageBackend + 'static,
    V: Visitor + 'static,
{
    pub fn new(backend: SharedBackend<B>, visitor: Arc<V>, stop: CancellationToken) -> Self {
        Self {
            backend,
            visitor,
            next_filter: None,
            threads: 1,
            execute_interval: Duration::ZERO,
            stop,
        }
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_execute_interval(mut self, interval: Duration) -> Self {
        self.execute_interval = interval;
        self
    }

    pub fn with_next_filter(mut self, filter: Option<Arc<dyn NextFilter>>) -> Self {
        self.next_filter = filter;
        self
    }

    /// Runs one round: fetches everything `generator` hands out
    ///
    /// The caller owns the segment writer; it must be open for the whole
    /// round. The first storage error stops the remaining workers and is
    /// returned once every worker has finished.
    pub async fn fetch_all(&self, generator: Generator<B>) -> Result<RoundStats, CrawlError> {
        let shared = Arc::new(Shared {
            backend: Arc::clone(&self.backend),
            generator: Mutex::new(generator),
            visitor: Arc::clone(&self.visitor),
            next_filter: self.next_filter.clone(),
            pacer: Pacer::new(self.execute_interval),
            stop: self.stop.child_token(),
        });

        let mut workers = JoinSet::new();
        for id in 0..self.threads {
            workers.spawn(run_worker(id, Arc::clone(&shared)));
        }

        let mut fetch = FetchStats::default();
        let mut failure: Option<CrawlError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(stats)) => fetch += stats,
                Ok(Err(e)) => {
                    shared.stop.cancel();
                    failure.get_or_insert(e.into());
                }
                Err(e) => {
                    shared.stop.cancel();
                    failure.get_or_insert(e.into());
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let generate = shared.generator.lock().await.stats();
        tracing::info!(
            "Fetch round finished: {} generated, {} success, {} redirected, {} retry, {} gone, {} outlinks",
            generate.generated,
            fetch.success,
            fetch.redirected,
            fetch.retried,
            fetch.gone,
            fetch.outlinks
        );
        Ok(RoundStats { generate, fetch })
    }
}

async fn run_worker<B, V>(id: usize, shared: Arc<Shared<B, V>>) -> Result<FetchStats, StorageError>
where
    B: StorageBackend,
    V: Visitor,
{
    let mut stats = FetchStats::default();
    loop {
        if shared.stop.is_cancelled() {
            tracing::debug!("Worker {} stopping on request", id);
            break;
        }

        let datum = match shared.generator.lock().await.next()? {
            Some(datum) => datum,
            None => break,
        };

        shared.pacer.wait().await;
        let (outcome, outlinks) = attempt(&shared, datum).await;
        stats.attempted += 1;
        match outcome.status {
            Status::Success => stats.success += 1,
            Status::Fetched => stats.redirected += 1,
            Status::Retry => stats.retried += 1,
            Status::Gone => stats.gone += 1,
            Status::Unfetched => {}
        }
        stats.outlinks += outlinks.len() as u64;

        {
            let mut backend = acquire(&shared.backend)?;
            backend.write_fetch_segment(&outcome)?;
            backend.write_parse_segment(&outlinks)?;
        }
    }
    Ok(stats)
}

/// What the visitor callbacks produced for one datum
struct Visited {
    result: Result<(), FetchError>,
    code: Option<u16>,
    location: Option<String>,
    outlinks: Vec<CrawlDatum>,
}

impl Visited {
    fn failed(error: FetchError) -> Self {
        Self {
            code: error.code(),
            result: Err(error),
            location: None,
            outlinks: Vec::new(),
        }
    }
}

async fn call_visitor<V: Visitor>(visitor: &V, datum: &CrawlDatum) -> Visited {
    let page = match visitor.fetch(datum).await {
        Ok(page) => page,
        Err(e) => return Visited::failed(e),
    };

    let mut outlinks = Vec::new();
    let result = match &page.location {
        Some(target) => {
            outlinks.push(datum.child(target.clone()));
            Ok(())
        }
        None => visitor.visit(datum, &page, &mut outlinks),
    };
    Visited {
        result,
        code: page.code,
        location: page.location,
        outlinks,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Fetches and visits one datum, returning its recorded outcome and outlinks
///
/// A panic in the visitor is recorded as a retryable failure of this datum.
async fn attempt<B, V>(shared: &Shared<B, V>, datum: CrawlDatum) -> (CrawlDatum, Vec<CrawlDatum>)
where
    V: Visitor,
{
    let visited = AssertUnwindSafe(call_visitor(shared.visitor.as_ref(), &datum))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            let reason = format!("visitor panicked: {}", panic_message(payload.as_ref()));
            tracing::warn!("{} on {}", reason, datum.url);
            Visited::failed(FetchError::retry(reason))
        });

    let mut outcome = datum.clone();
    outcome.code = visited.code;
    let mut outlinks = visited.outlinks;

    match (visited.result, visited.location) {
        (Ok(()), Some(target)) => {
            outcome.record_redirect(Utc::now(), target);
            tracing::debug!("redirected: {}", outcome.brief_info());
        }
        (Ok(()), None) => {
            outcome.record_success(Utc::now());
            tracing::debug!("done: {}", outcome.brief_info());
        }
        (Err(FetchError::Retry { reason, .. }), _) => {
            outlinks.clear();
            outcome.record_retry(Utc::now());
            tracing::debug!("failed: {} ({})", outcome.brief_info(), reason);
        }
        (Err(FetchError::Gone { reason, .. }), _) => {
            outlinks.clear();
            outcome.record_gone(Utc::now());
            tracing::debug!("gone: {} ({})", outcome.brief_info(), reason);
        }
    }

    let outlinks = outlinks
        .into_iter()
        .map(|next| adopt(next, &datum))
        .filter_map(|next| match &shared.next_filter {
            Some(filter) => filter.filter(next, &datum),
            None => Some(next),
        })
        .collect();
    (outcome, outlinks)
}

/// Turns a visitor-supplied outlink into a fresh child of `parent`
fn adopt(mut next: CrawlDatum, parent: &CrawlDatum) -> CrawlDatum {
    if next.meta(META_KEY_DEPTH).is_none() {
        next.set_meta(META_KEY_DEPTH, parent.depth() + 1);
    }
    if next.meta(META_KEY_REFERRER).is_none() {
        next.set_meta(META_KEY_REFERRER, parent.url.clone());
    }
    next.inherit_metadata(&parent.metadata);
    next.status = Status::Unfetched;
    next
}
