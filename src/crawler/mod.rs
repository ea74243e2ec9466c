//! Crawler module: the generate → fetch → merge pipeline
//!
//! This module contains the crawl engine on top of a `StorageBackend`:
//! - Work generation with composable filters
//! - The fetch worker pool and the visitor callbacks it drives
//! - The coordinator that runs iterations and handles seeds and stops
//! - A bundled HTTP visitor used by the binary

mod coordinator;
mod fetcher;
mod generator;
pub mod http;
mod parser;
mod rule;
mod visitor;

pub use coordinator::{CrawlReport, Crawler, CrawlerStatus, IterationReport, StopHandle};
pub use fetcher::{FetchStats, Fetcher, RoundStats};
pub use generator::{
    ExecuteCountFilter, FilterChain, GenerateStats, Generator, GeneratorFilter, RetryFilter,
    StatusFilter, DEFAULT_PAGE_SIZE,
};
pub use http::HttpVisitor;
pub use parser::extract_links;
pub use rule::RegexRule;
pub use visitor::{FetchError, NextFilter, Page, Visitor};
