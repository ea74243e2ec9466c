//! Statistics generation from the crawl database
//!
//! This module provides functionality for extracting and displaying
//! crawl statistics from a storage backend and from a finished crawl.

use crate::config::CrawlerConfig;
use crate::crawler::CrawlReport;
use crate::state::Status;
use crate::storage::{BackendStats, StorageBackend, StorageResult};
use std::io::{self, Write};

/// Crawl statistics summary
#[derive(Debug, Clone, Default)]
pub struct CrawlStatistics {
    /// Backend counters
    pub backend: BackendStats,

    /// Retry limit the given-up count was computed with
    pub max_retry: u32,

    /// Execution limit the given-up count was computed with
    pub max_execute_count: Option<u32>,
}

impl CrawlStatistics {
    pub fn total(&self) -> u64 {
        self.backend.total()
    }

    /// Share of committed datums that were fetched and visited, in percent
    pub fn success_rate(&self) -> f64 {
        percentage(self.backend.count(Status::Success), self.total())
    }
}

fn percentage(count: u64, total: u64) -> f64 {
    if total > 0 {
        (count as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

/// Loads statistics from an open backend
pub fn load_statistics<B>(backend: &B, config: &CrawlerConfig) -> StorageResult<CrawlStatistics>
where
    B: StorageBackend + ?Sized,
{
    let max_execute_count = config.max_execute_count_limit();
    Ok(CrawlStatistics {
        backend: backend.stats(config.max_retry, max_execute_count)?,
        max_retry: config.max_retry,
        max_execute_count,
    })
}

/// Writes statistics in a formatted manner
pub fn write_statistics(stats: &CrawlStatistics, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "=== Crawl Statistics ===\n")?;

    writeln!(out, "Overview:")?;
    writeln!(out, "  Total datums: {}", stats.total())?;
    writeln!(out, "  Pending segments: {}", stats.backend.pending_segments)?;
    writeln!(out, "  Pending injections: {}", stats.backend.pending_injections)?;
    writeln!(out)?;

    writeln!(out, "Datums by Status:")?;
    for status in Status::all_statuses() {
        let count = stats.backend.count(status);
        writeln!(
            out,
            "  {}: {} ({:.1}%)",
            status,
            count,
            percentage(count, stats.total())
        )?;
    }
    writeln!(out)?;

    let execute_limit = stats
        .max_execute_count
        .map_or_else(|| "unlimited".to_string(), |max| max.to_string());
    writeln!(
        out,
        "Given up: {} (max retry {}, max execute count {})",
        stats.backend.given_up, stats.max_retry, execute_limit
    )?;

    let lock = &stats.backend.lock;
    if lock.locked {
        let since = lock
            .locked_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "unknown time".to_string());
        writeln!(out, "Lock: held since {}", since)?;
    } else {
        writeln!(out, "Lock: released")?;
    }

    writeln!(
        out,
        "Success Rate: {:.1}% ({} / {} datums fetched and visited)",
        stats.success_rate(),
        stats.backend.count(Status::Success),
        stats.total()
    )
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &CrawlStatistics) -> io::Result<()> {
    write_statistics(stats, &mut io::stdout().lock())
}

/// Writes the per-iteration breakdown of a finished crawl
pub fn write_report(report: &CrawlReport, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "=== Crawl Report ===\n")?;
    writeln!(
        out,
        "Seeds merged: {} new, {} forced",
        report.injection.new_keys, report.injection.forced
    )?;

    for iteration in &report.iterations {
        writeln!(
            out,
            "  depth {} [{}]: {} generated, {} success, {} redirected, {} retry, {} gone, {} outlinks, {} keys ({:.1}s)",
            iteration.depth,
            iteration.segment,
            iteration.generate.generated,
            iteration.fetch.success,
            iteration.fetch.redirected,
            iteration.fetch.retried,
            iteration.fetch.gone,
            iteration.fetch.outlinks,
            iteration.merge.total_keys,
            iteration.elapsed.as_secs_f64()
        )?;
    }

    if report.stopped {
        writeln!(out, "\nStopped on request")?;
    }
    writeln!(out, "\n{}", report.summary())
}
