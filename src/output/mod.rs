//! Output module for crawl statistics and reports
//!
//! This module handles:
//! - Rendering backend statistics for the `--stats` mode
//! - Rendering the report of a finished crawl
//! - Dumping the committed snapshot

mod dump;
pub mod stats;

pub use dump::dump_datums;
pub use stats::{
    load_statistics, print_statistics, write_report, write_statistics, CrawlStatistics,
};
