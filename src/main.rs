//! Ripple-CrawlDB main entry point
//!
//! This is the command-line interface for running and inspecting crawls.

use anyhow::Context;
use clap::Parser;
use ripple_crawldb::config::{load_config_with_hash, BackendKind, Config};
use ripple_crawldb::crawler::{Crawler, HttpVisitor};
use ripple_crawldb::output::{dump_datums, load_statistics, print_statistics, write_report};
use ripple_crawldb::storage::{MemoryBackend, SqliteBackend, StorageBackend};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Ripple-CrawlDB: a resumable crawl-state engine
///
/// Runs a crawl described by a TOML configuration file, iteration after
/// iteration, keeping every URL's state in a crawl database that survives
/// interruptions.
#[derive(Parser, Debug)]
#[command(name = "ripple-crawldb")]
#[command(version)]
#[command(about = "A resumable crawl-state engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume the existing crawl database
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Clear the existing crawl database before crawling
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with_all = ["stats", "dump", "unlock"])]
    dry_run: bool,

    /// Show statistics from the crawl database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "dump", "unlock"])]
    stats: bool,

    /// Print every datum of the crawl database as JSON lines and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "unlock"])]
    dump: bool,

    /// Clear a stale lock left by a crashed run and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "dump"])]
    unlock: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.fresh {
        config.crawler.resumable = false;
    } else if cli.resume {
        config.crawler.resumable = true;
    }

    if cli.dry_run {
        handle_dry_run(&config);
        return Ok(());
    }

    match config.storage.backend {
        BackendKind::Sqlite => {
            let backend = SqliteBackend::new(&config.storage.path);
            run(&cli, config, config_hash, backend).await
        }
        BackendKind::Memory => {
            if cli.stats || cli.dump || cli.unlock {
                anyhow::bail!("The memory backend keeps no state between runs");
            }
            run(&cli, config, config_hash, MemoryBackend::new()).await
        }
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("ripple_crawldb=info,warn"),
            1 => EnvFilter::new("ripple_crawldb=debug,info"),
            2 => EnvFilter::new("ripple_crawldb=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

async fn run<B>(cli: &Cli, config: Config, config_hash: String, backend: B) -> anyhow::Result<()>
where
    B: StorageBackend + 'static,
{
    if cli.stats {
        handle_stats(&config, backend)
    } else if cli.dump {
        handle_dump(backend)
    } else if cli.unlock {
        handle_unlock(backend)
    } else {
        handle_crawl(config, config_hash, backend).await
    }
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config) {
    println!("=== Ripple-CrawlDB Dry Run ===\n");

    let crawler = &config.crawler;
    println!("Crawler Configuration:");
    println!("  Threads: {}", crawler.threads);
    println!("  Execute interval: {}ms", crawler.execute_interval);
    println!("  Max retry: {}", crawler.max_retry);
    println!("  Max execute count: {}", crawler.max_execute_count);
    println!("  Top N: {}", crawler.top_n);
    println!("  Depth: {}", crawler.depth);
    println!("  Resumable: {}", crawler.resumable);

    println!("\nStorage:");
    println!("  Backend: {:?}", config.storage.backend);
    println!("  Path: {}", config.storage.path);

    println!("\nHTTP:");
    println!("  User agent: {}", config.http.user_agent);
    println!("  Timeout: {}s", config.http.timeout_secs);
    println!("  Same host only: {}", config.http.same_host_only);
    for rule in &config.http.regex {
        println!("  URL rule: {}", rule);
    }

    println!("\nSeeds ({}):", config.seeds.len());
    for seed in &config.seeds {
        let type_tag = seed.type_tag.as_deref().unwrap_or("-");
        let force = if seed.force { " (forced)" } else { "" };
        println!("  - {} [{}]{}", seed.url, type_tag, force);
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the crawl database
fn handle_stats<B: StorageBackend>(config: &Config, mut backend: B) -> anyhow::Result<()> {
    if !backend.is_db_exists() {
        anyhow::bail!("No crawl database at {}", config.storage.path);
    }
    println!("Crawl database: {}\n", config.storage.path);

    backend.open()?;
    let stats = load_statistics(&backend, &config.crawler)?;
    backend.close()?;

    print_statistics(&stats)?;
    Ok(())
}

/// Handles the --dump mode: prints every committed datum
fn handle_dump<B: StorageBackend>(mut backend: B) -> anyhow::Result<()> {
    if !backend.is_db_exists() {
        anyhow::bail!("No crawl database to dump");
    }
    backend.open()?;
    let written = dump_datums(&backend, &mut std::io::stdout().lock())?;
    backend.close()?;

    tracing::info!("Dumped {} datums", written);
    Ok(())
}

/// Handles the --unlock mode: clears a stale lock marker
fn handle_unlock<B: StorageBackend>(mut backend: B) -> anyhow::Result<()> {
    if !backend.is_db_exists() {
        anyhow::bail!("No crawl database to unlock");
    }
    backend.open()?;
    if backend.is_locked()? {
        backend.unlock()?;
        println!("✓ Lock cleared");
    } else {
        println!("Crawl database is not locked");
    }
    backend.close()?;
    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl<B>(config: Config, config_hash: String, backend: B) -> anyhow::Result<()>
where
    B: StorageBackend + 'static,
{
    if config.crawler.resumable {
        tracing::info!("Starting crawl (resuming the existing crawl database)");
    } else {
        tracing::info!("Starting fresh crawl (clearing the existing crawl database)");
    }
    tracing::info!("Total seed URLs: {}", config.seeds.len());

    let visitor = HttpVisitor::new(&config.http).context("Failed to build HTTP client")?;
    let rule = config.http.regex_rule().context("Invalid URL rules")?;
    let mut crawler =
        Crawler::from_config(backend, visitor, &config).with_config_hash(config_hash);
    if !rule.is_empty() {
        tracing::info!("Filtering outlinks with {} URL rules", config.http.regex.len());
        crawler = crawler.with_next_filter(rule);
    }

    let stop = crawler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing the current iteration");
            stop.stop();
        }
    });

    match crawler.start(config.crawler.depth).await {
        Ok(report) => {
            write_report(&report, &mut std::io::stdout().lock())?;
            Ok(())
        }
        Err(e) => {
            tracing::error!("Crawl failed: {}", e);
            Err(e.into())
        }
    }
}
