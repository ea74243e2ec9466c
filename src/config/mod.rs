//! Configuration module
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use ripple_crawldb::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("crawl.toml")).unwrap();
//! println!("Crawl will run {} iteration(s)", config.crawler.depth);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{BackendKind, Config, CrawlerConfig, HttpConfig, SeedEntry, StorageConfig};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
