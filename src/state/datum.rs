//! The per-URL state record
//!
//! A `CrawlDatum` is identified by its key, which defaults to the URL. The
//! engine never interprets the key or the URL; both are opaque strings.

use crate::crawler::RegexRule;
use crate::state::Status;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Open, string-keyed metadata carried by a datum
pub type Metadata = serde_json::Map<String, Value>;

/// Metadata key holding the caller-supplied type tag
pub const META_KEY_TYPE: &str = "type";

/// Metadata key holding the link depth from the seed
pub const META_KEY_DEPTH: &str = "depth";

/// Metadata key holding the URL of the page that emitted this datum
pub const META_KEY_REFERRER: &str = "referrer";

/// State record for a single URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlDatum {
    /// Deduplication key (the URL unless overridden)
    pub key: String,

    /// URL to fetch
    pub url: String,

    /// Observed status
    pub status: Status,

    /// Failed fetch attempts since the last success
    pub retry: u32,

    /// Total generate-and-attempt cycles, regardless of outcome
    pub execute_count: u32,

    /// When the last attempt happened (`None` if never attempted)
    pub fetch_time: Option<DateTime<Utc>>,

    /// HTTP status code of the last attempt, if any
    pub code: Option<u16>,

    /// Redirect target reported by the last attempt
    pub location: Option<String>,

    /// Arbitrary metadata that survives storage round-trips
    #[serde(default)]
    pub metadata: Metadata,
}

impl CrawlDatum {
    /// Creates an unfetched datum keyed by its URL
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            key: url.clone(),
            url,
            status: Status::Unfetched,
            retry: 0,
            execute_count: 0,
            fetch_time: None,
            code: None,
            location: None,
            metadata: Metadata::new(),
        }
    }

    /// Overrides the deduplication key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Sets the type tag
    pub fn with_type(self, type_tag: impl Into<String>) -> Self {
        self.with_meta(META_KEY_TYPE, type_tag.into())
    }

    /// Sets a metadata entry
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets a metadata entry in place
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Returns a metadata entry as a string, if it is one
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Returns the type tag, if any
    pub fn type_tag(&self) -> Option<&str> {
        self.meta_str(META_KEY_TYPE)
    }

    /// Returns true if the type tag equals `type_tag` (`None` matches untagged datums)
    pub fn matches_type(&self, type_tag: Option<&str>) -> bool {
        self.type_tag() == type_tag
    }

    /// Returns true if the whole URL matches `pattern`
    pub fn matches_url(&self, pattern: &str) -> Result<bool, regex::Error> {
        let re = regex::Regex::new(&format!("^(?:{})$", pattern))?;
        Ok(re.is_match(&self.url))
    }

    /// Returns true if the URL satisfies `rule`
    pub fn matches_rule(&self, rule: &RegexRule) -> bool {
        rule.satisfy(&self.url)
    }

    /// Link depth from the seed (seeds are depth 0)
    pub fn depth(&self) -> u64 {
        self.meta(META_KEY_DEPTH)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// Creates an unfetched outlink that inherits this datum's metadata
    ///
    /// The child gets `depth + 1` and a referrer pointing back at this datum.
    /// Counters, timestamps and fetch results are not inherited.
    pub fn child(&self, url: impl Into<String>) -> Self {
        let mut child = Self::new(url);
        child.metadata = self.metadata.clone();
        child.set_meta(META_KEY_DEPTH, self.depth() + 1);
        child.set_meta(META_KEY_REFERRER, self.url.clone());
        child
    }

    /// Fills in metadata entries this datum does not set itself
    pub fn inherit_metadata(&mut self, parent: &Metadata) {
        for (key, value) in parent {
            if !self.metadata.contains_key(key) {
                self.metadata.insert(key.clone(), value.clone());
            }
        }
    }

    /// Records a fetch-and-visit that completed
    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.begin_attempt(at);
        self.status = Status::Success;
        self.retry = 0;
    }

    /// Records a fetch that returned a redirect which was not followed
    pub fn record_redirect(&mut self, at: DateTime<Utc>, location: impl Into<String>) {
        self.begin_attempt(at);
        self.status = Status::Fetched;
        self.location = Some(location.into());
        self.retry = 0;
    }

    /// Records a transient failure
    pub fn record_retry(&mut self, at: DateTime<Utc>) {
        self.begin_attempt(at);
        self.status = Status::Retry;
        self.retry += 1;
    }

    /// Records a permanent failure
    ///
    /// Counts as a failed attempt like a retry does.
    pub fn record_gone(&mut self, at: DateTime<Utc>) {
        self.begin_attempt(at);
        self.status = Status::Gone;
        self.retry += 1;
    }

    fn begin_attempt(&mut self, at: DateTime<Utc>) {
        self.execute_count += 1;
        self.fetch_time = Some(at);
    }

    /// Returns a short single-line description for logging
    pub fn brief_info(&self) -> String {
        let mut info = String::new();
        if let Some(code) = self.code {
            info.push_str(&format!("[{}", code));
            if let Some(location) = &self.location {
                info.push_str(&format!(" -> {}", location));
            }
            info.push_str("] ");
        }
        info.push_str(&format!("Key: {} (URL: {})", self.key, self.url));
        info
    }
}
