//! Integration tests for the crawl database and the crawl loop

mod backend_conformance;
mod crawl_tests;
