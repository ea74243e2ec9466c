//! State module for tracking crawl progress
//!
//! This module provides the per-URL state record and its status rules.
//!
//! # Components
//!
//! - `Status`: The persistent, observed state of a URL, ordered by merge priority
//! - `Injection`: Transient injection requests that never reach the committed store
//! - `CrawlDatum`: The state record for one URL key

mod datum;
mod status;

// Re-export main types
pub use datum::{CrawlDatum, Metadata, META_KEY_DEPTH, META_KEY_REFERRER, META_KEY_TYPE};
pub use status::{CandidateStatus, Injection, Status};
