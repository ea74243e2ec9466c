//! The fetch and visit callbacks
//!
//! The engine never performs I/O on URLs itself. A `Visitor` fetches the
//! datum's URL and visits the resulting page, reporting the outlinks it
//! wants crawled next. Both steps may fail; the error kind decides whether
//! the datum is retried or given up on.

use crate::state::CrawlDatum;
use async_trait::async_trait;
use thiserror::Error;

/// A fetched page, opaque to the engine apart from the redirect location
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Final URL of the response
    pub url: String,

    /// HTTP status code, when the transport has one
    pub code: Option<u16>,

    /// Redirect target that was not followed
    ///
    /// A page with a location is recorded as `Fetched` and is not visited;
    /// the location is crawled as an outlink instead.
    pub location: Option<String>,

    pub content_type: Option<String>,

    pub body: Vec<u8>,
}

impl Page {
    /// A page with a body
    pub fn new(url: impl Into<String>, code: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            url: url.into(),
            code: Some(code),
            body: body.into(),
            ..Self::default()
        }
    }

    /// A redirect response pointing at `location`
    pub fn redirect(url: impl Into<String>, code: u16, location: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            code: Some(code),
            location: Some(location.into()),
            ..Self::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A failed fetch or visit
///
/// `code` is the HTTP status of the failed response, if there was one; it
/// is recorded on the datum.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Transient failure; the datum is offered again until its retry limit
    #[error("retryable failure: {reason}")]
    Retry { reason: String, code: Option<u16> },

    /// Permanent failure; the datum is recorded as gone
    #[error("gone: {reason}")]
    Gone { reason: String, code: Option<u16> },
}

impl FetchError {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry {
            reason: reason.into(),
            code: None,
        }
    }

    pub fn gone(reason: impl Into<String>) -> Self {
        Self::Gone {
            reason: reason.into(),
            code: None,
        }
    }

    /// Attaches the HTTP status of the failed response
    pub fn with_code(mut self, status: u16) -> Self {
        match &mut self {
            Self::Retry { code, .. } | Self::Gone { code, .. } => *code = Some(status),
        }
        self
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Retry { code, .. } | Self::Gone { code, .. } => *code,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Retry { reason, .. } | Self::Gone { reason, .. } => reason,
        }
    }
}

/// The external fetch and visit callback
#[async_trait]
pub trait Visitor: Send + Sync {
    /// Fetches the datum's URL
    async fn fetch(&self, datum: &CrawlDatum) -> Result<Page, FetchError>;

    /// Visits a fetched page, pushing outlinks onto `next`
    ///
    /// Outlinks inherit the metadata of `datum` for every key they do not
    /// set themselves. Outlinks pushed before an error are discarded.
    fn visit(
        &self,
        datum: &CrawlDatum,
        page: &Page,
        next: &mut Vec<CrawlDatum>,
    ) -> Result<(), FetchError>;
}

/// Filters outlinks before they are written to the parse segment
pub trait NextFilter: Send + Sync {
    /// Returns the outlink to keep (possibly rewritten), or `None` to drop it
    fn filter(&self, next: CrawlDatum, parent: &CrawlDatum) -> Option<CrawlDatum>;
}

impl<F> NextFilter for F
where
    F: Fn(CrawlDatum, &CrawlDatum) -> Option<CrawlDatum> + Send + Sync,
{
    fn filter(&self, next: CrawlDatum, parent: &CrawlDatum) -> Option<CrawlDatum> {
        self(next, parent)
    }
}
