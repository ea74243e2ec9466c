//! Ripple-CrawlDB: a resumable crawl-state engine
//!
//! This crate tracks the state of every URL a crawl has seen, generates
//! bounded batches of work from that state, runs fetch and visit callbacks
//! on a worker pool and merges the results back, iteration after iteration.
//! All durable state goes through a `StorageBackend`, so a crawl that is
//! killed can be resumed without losing or duplicating URLs.

pub mod config;
pub mod crawler;
pub mod output;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Main error type for crawl operations
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("No seeds were added and the crawl is not resumable")]
    NoSeeds,

    #[error("Fetch worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for crawl operations
pub type Result<T> = std::result::Result<T, CrawlError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use crawler::{CrawlReport, Crawler, FetchError, Page, Visitor};
pub use state::{CrawlDatum, Status};
pub use storage::{MemoryBackend, SqliteBackend, StorageBackend, StorageResult};
