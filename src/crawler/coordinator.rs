//! Crawler coordinator - main crawl orchestration logic
//!
//! This module contains the crawl loop that drives a crawl database through
//! its iterations:
//! - Clearing or resuming the database and checking the lock
//! - Injecting seeds and folding them in with a first merge
//! - Running generate → fetch → merge up to `depth` times
//! - Handling stop requests between iterations and between dispatches

use crate::config::{Config, CrawlerConfig};
use crate::crawler::fetcher::{FetchStats, Fetcher};
use crate::crawler::generator::{FilterChain, GenerateStats, Generator, GeneratorFilter};
use crate::crawler::visitor::{NextFilter, Visitor};
use crate::state::{CrawlDatum, Status};
use crate::storage::{acquire, share, MergeStats, SegmentName, SharedBackend, StorageBackend};
use crate::CrawlError;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Lifecycle state of a crawler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlerStatus {
    Running,
    Stopped,
}

/// Requests a graceful stop of a running crawl
///
/// The in-flight iteration finishes its dispatched fetches and is merged
/// before the crawl returns.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// What happened in one generate → fetch → merge iteration
#[derive(Debug, Clone, PartialEq)]
pub struct IterationReport {
    /// 1-based iteration number
    pub depth: u32,
    pub segment: SegmentName,
    pub generate: GenerateStats,
    pub fetch: FetchStats,
    pub merge: MergeStats,
    pub elapsed: Duration,
}

/// Outcome of a completed crawl
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrawlReport {
    /// Merge that folded the seeds and any leftover segments before the first iteration
    pub injection: MergeStats,
    pub iterations: Vec<IterationReport>,

    /// Committed datums per status after the last merge
    pub by_status: BTreeMap<Status, u64>,

    /// Fetchable datums that will not be offered again because of the limits
    pub given_up: u64,

    /// True if the crawl ended because a stop was requested
    pub stopped: bool,
    pub elapsed: Duration,
}

impl CrawlReport {
    pub fn total_generated(&self) -> u64 {
        self.iterations.iter().map(|i| i.generate.generated).sum()
    }

    pub fn count(&self, status: Status) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "completed {} iteration(s), {} datums still unfetched due to limits",
            self.iterations.len(),
            self.given_up
        )
    }
}

/// Drives a crawl database through its iterations
pub struct Crawler<B, V> {
    backend: SharedBackend<B>,
    visitor: Arc<V>,
    config: CrawlerConfig,
    config_hash: Option<String>,
    seeds: Vec<CrawlDatum>,
    forced_seeds: Vec<CrawlDatum>,
    generator_filter: Arc<dyn GeneratorFilter>,
    next_filter: Option<Arc<dyn NextFilter>>,
    status: CrawlerStatus,
    stop: CancellationToken,
}

impl<B, V> Crawler<B, V>
where
    B: StorageBackend + 'static,
    V: Visitor + 'static,
{
    /// Creates a crawler with the standard generator filter for `config`
    pub fn new(backend: B, visitor: V, config: CrawlerConfig) -> Self {
        let generator_filter = Arc::new(FilterChain::standard(
            config.max_retry,
            config.max_execute_count_limit(),
        ));
        Self {
            backend: share(backend),
            visitor: Arc::new(visitor),
            config,
            config_hash: None,
            seeds: Vec::new(),
            forced_seeds: Vec::new(),
            generator_filter,
            next_filter: None,
            status: CrawlerStatus::Stopped,
            stop: CancellationToken::new(),
        }
    }

    /// Creates a crawler from a loaded configuration, adding its seeds
    pub fn from_config(backend: B, visitor: V, config: &Config) -> Self {
        let mut crawler = Self::new(backend, visitor, config.crawler.clone());
        for seed in &config.seeds {
            let mut datum = CrawlDatum::new(seed.url.clone());
            if let Some(type_tag) = &seed.type_tag {
                datum = datum.with_type(type_tag.clone());
            }
            crawler.add_seed_datum(datum, seed.force);
        }
        crawler
    }

    /// Records the configuration hash stored in the lock record
    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    /// Replaces the standard generator filter
    pub fn with_generator_filter(mut self, filter: impl GeneratorFilter + 'static) -> Self {
        self.generator_filter = Arc::new(filter);
        self
    }

    pub fn with_next_filter(mut self, filter: impl NextFilter + 'static) -> Self {
        self.next_filter = Some(Arc::new(filter));
        self
    }

    // ===== Seeds =====

    pub fn add_seed(&mut self, url: impl Into<String>) {
        self.add_seed_datum(CrawlDatum::new(url), false);
    }

    pub fn add_seed_with_type(&mut self, url: impl Into<String>, type_tag: impl Into<String>) {
        self.add_seed_datum(CrawlDatum::new(url).with_type(type_tag), false);
    }

    /// Adds a seed that is reset to unfetched even if the database knows it
    pub fn add_forced_seed(&mut self, url: impl Into<String>) {
        self.add_seed_datum(CrawlDatum::new(url), true);
    }

    pub fn add_seeds<I, S>(&mut self, urls: I, force: bool)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for url in urls {
            self.add_seed_datum(CrawlDatum::new(url), force);
        }
    }

    /// Adds a prepared seed datum (key, metadata and type tag are kept)
    pub fn add_seed_datum(&mut self, datum: CrawlDatum, force: bool) {
        if force {
            self.forced_seeds.push(datum);
        } else {
            self.seeds.push(datum);
        }
    }

    pub fn seed_count(&self) -> usize {
        self.seeds.len() + self.forced_seeds.len()
    }

    // ===== State =====

    pub fn status(&self) -> CrawlerStatus {
        self.status
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stop.clone())
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn backend(&self) -> &SharedBackend<B> {
        &self.backend
    }

    // ===== Run =====

    /// Runs up to `depth` iterations
    ///
    /// Storage failures are fatal: the error is returned, the current
    /// snapshot is left untouched and unmerged segments stay pending for
    /// the next resumed run.
    pub async fn start(&mut self, depth: u32) -> Result<CrawlReport, CrawlError> {
        let started = Instant::now();
        let injection = match self.prepare() {
            Ok(injection) => injection,
            Err(e) => {
                tracing::error!("Failed to prepare the crawl database: {}", e);
                self.close_after_failure();
                return Err(e);
            }
        };

        self.status = CrawlerStatus::Running;
        let result = self.run_iterations(depth).await;
        self.status = CrawlerStatus::Stopped;

        let iterations = match result {
            Ok(iterations) => iterations,
            Err(e) => {
                tracing::error!("Crawl halted with a fatal error: {}", e);
                self.close_after_failure();
                return Err(e);
            }
        };

        let stopped = self.stop.is_cancelled();
        let report = {
            let mut backend = acquire(&self.backend)?;
            let report = CrawlReport {
                injection,
                iterations,
                by_status: backend.count_by_status()?,
                given_up: backend.count_given_up(
                    self.config.max_retry,
                    self.config.max_execute_count_limit(),
                )?,
                stopped,
                elapsed: started.elapsed(),
            };
            backend.unlock()?;
            backend.close()?;
            report
        };

        if stopped {
            // Stop handles are per run.
            self.stop = CancellationToken::new();
        }
        tracing::info!("Crawl finished: {}", report.summary());
        Ok(report)
    }

    /// Closes the backend after a fatal error, keeping the lock for the next run
    fn close_after_failure(&self) {
        let closed = acquire(&self.backend).and_then(|mut backend| backend.close());
        if let Err(e) = closed {
            tracing::warn!("Failed to close crawl database: {}", e);
        }
    }

    /// Clears or resumes the database, takes the lock and injects the seeds
    fn prepare(&mut self) -> Result<MergeStats, CrawlError> {
        let mut backend = acquire(&self.backend)?;

        if !self.config.resumable {
            if self.seeds.is_empty() && self.forced_seeds.is_empty() {
                return Err(CrawlError::NoSeeds);
            }
            if backend.is_db_exists() {
                tracing::info!("Clearing existing {} crawl database", backend.name());
                backend.clear()?;
            }
        }

        backend.open()?;

        let record = backend.lock_record()?;
        if record.locked {
            tracing::warn!(
                "Crawl database is still locked (taken at {}); the previous run did not exit cleanly, resuming",
                record
                    .locked_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "unknown time".to_string())
            );
        }
        if let (Some(previous), Some(current)) = (&record.config_hash, &self.config_hash) {
            if previous != current {
                tracing::warn!("Configuration changed since the crawl database was last locked");
            }
        }
        backend.lock(self.config_hash.as_deref())?;

        let injected = backend.inject_all(&self.seeds, false)?;
        let forced = backend.inject_all(&self.forced_seeds, true)?;
        tracing::info!(
            "Injected {} seed(s) and {} forced seed(s)",
            injected,
            forced
        );

        Ok(backend.merge()?)
    }

    async fn run_iterations(&self, depth: u32) -> Result<Vec<IterationReport>, CrawlError> {
        let mut reports = Vec::new();

        for depth in 1..=depth {
            if self.stop.is_cancelled() {
                tracing::info!("Stop requested, not starting depth {}", depth);
                break;
            }

            tracing::info!("start depth {}", depth);
            let started = Instant::now();
            let segment = acquire(&self.backend)?.init_segment_writer()?;

            let generator = Generator::new(
                Arc::clone(&self.backend),
                Arc::clone(&self.generator_filter),
                self.config.top_n_limit(),
            );
            let fetcher = Fetcher::new(
                Arc::clone(&self.backend),
                Arc::clone(&self.visitor),
                self.stop.clone(),
            )
            .with_threads(self.config.threads as usize)
            .with_execute_interval(self.config.execute_interval())
            .with_next_filter(self.next_filter.clone());

            let round = fetcher.fetch_all(generator).await;
            acquire(&self.backend)?.close_segment_writer()?;
            let round = round?;

            let merge = acquire(&self.backend)?.merge()?;
            let report = IterationReport {
                depth,
                segment,
                generate: round.generate,
                fetch: round.fetch,
                merge,
                elapsed: started.elapsed(),
            };
            tracing::info!(
                "depth {} finish: {} urls in {:.1}s",
                depth,
                report.generate.generated,
                report.elapsed.as_secs_f64()
            );
            let generated = report.generate.generated;
            reports.push(report);

            if generated == 0 {
                tracing::info!("Nothing left to generate, stopping early");
                break;
            }
        }

        Ok(reports)
    }
}
