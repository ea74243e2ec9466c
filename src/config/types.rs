use crate::crawler::RegexRule;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for a crawl
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default, rename = "seed")]
    pub seeds: Vec<SeedEntry>,
}

/// Crawl engine configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlerConfig {
    /// Number of fetch workers
    pub threads: u32,

    /// Minimum time between two dispatches of the worker pool (milliseconds)
    pub execute_interval: u64,

    /// Failed attempts allowed before a datum is given up on
    pub max_retry: u32,

    /// Attempts allowed per datum, -1 for unlimited
    pub max_execute_count: i64,

    /// Datums generated per iteration, -1 for unbounded
    pub top_n: i64,

    /// Keep the existing crawl database instead of clearing it on start
    pub resumable: bool,

    /// Number of generate → fetch → merge iterations
    pub depth: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            threads: 50,
            execute_interval: 0,
            max_retry: 3,
            max_execute_count: -1,
            top_n: -1,
            resumable: false,
            depth: 1,
        }
    }
}

impl CrawlerConfig {
    /// Per-iteration generation limit (`None` means unbounded)
    pub fn top_n_limit(&self) -> Option<usize> {
        usize::try_from(self.top_n).ok()
    }

    /// Per-datum execution limit (`None` means unlimited)
    pub fn max_execute_count_limit(&self) -> Option<u32> {
        u32::try_from(self.max_execute_count).ok()
    }

    pub fn execute_interval(&self) -> Duration {
        Duration::from_millis(self.execute_interval)
    }
}

/// Which storage backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

/// Crawl database configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConfig {
    pub backend: BackendKind,

    /// Directory holding the crawl database
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: "./crawl".to_string(),
        }
    }
}

/// Configuration of the bundled HTTP visitor
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HttpConfig {
    pub user_agent: String,

    /// Request timeout (seconds)
    pub timeout_secs: u64,

    /// Only follow links to the host of the page they were found on
    pub same_host_only: bool,

    /// URL rules for outlinks: `-pattern` rejects, `+pattern` or `pattern` accepts
    pub regex: Vec<String>,
}

impl HttpConfig {
    /// Compiles the `regex` list into a rule
    pub fn regex_rule(&self) -> Result<RegexRule, regex::Error> {
        RegexRule::from_rules(&self.regex)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            same_host_only: true,
            regex: Vec::new(),
        }
    }
}

/// A seed URL
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub url: String,

    /// Optional type tag stored in the seed's metadata
    #[serde(default, rename = "type")]
    pub type_tag: Option<String>,

    /// Reset the URL to unfetched even if it is already known
    #[serde(default)]
    pub force: bool,
}
