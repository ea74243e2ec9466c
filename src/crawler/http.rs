//! Bundled HTTP visitor
//!
//! A plain `Visitor` used by the binary: GETs the datum URL without
//! following redirects and extracts the page's `<a href>` links as outlinks.

use crate::config::HttpConfig;
use crate::crawler::parser::{extract_links, is_same_host};
use crate::crawler::visitor::{FetchError, Page, Visitor};
use crate::state::CrawlDatum;
use crate::CrawlError;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{redirect::Policy, Client, StatusCode};
use std::time::Duration;
use url::Url;

/// Builds an HTTP client for the visitor
///
/// Redirects are not followed: a redirect is recorded on the datum and its
/// target is crawled as an outlink.
pub fn build_http_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.clone())
        .timeout(Duration::from_secs(config.timeout_secs))
        .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
        .redirect(Policy::none())
        .gzip(true)
        .brotli(true)
        .build()
}

/// Fetches pages over HTTP and follows their links
pub struct HttpVisitor {
    client: Client,
    same_host_only: bool,
}

impl HttpVisitor {
    pub fn new(config: &HttpConfig) -> Result<Self, CrawlError> {
        Ok(Self {
            client: build_http_client(config)?,
            same_host_only: config.same_host_only,
        })
    }
}

/// Maps an HTTP status that did not produce a page to a fetch error
///
/// | Status | Outcome |
/// |--------|---------|
/// | 404, 410 | Gone |
/// | anything else | Retry |
fn classify_status(status: StatusCode) -> FetchError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            FetchError::gone(format!("HTTP {}", status.as_u16())).with_code(status.as_u16())
        }
        _ => FetchError::retry(format!("HTTP {}", status.as_u16())).with_code(status.as_u16()),
    }
}

fn classify_error(error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::retry("request timeout")
    } else if error.is_connect() {
        FetchError::retry(format!("connection failed: {}", error))
    } else {
        FetchError::retry(error.to_string())
    }
}

#[async_trait]
impl Visitor for HttpVisitor {
    async fn fetch(&self, datum: &CrawlDatum) -> Result<Page, FetchError> {
        let url = Url::parse(&datum.url).map_err(|e| FetchError::gone(e.to_string()))?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify_error(&e))?;
        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| url.join(v).ok())
                .ok_or_else(|| classify_status(status))?;
            return Ok(Page::redirect(url.as_str(), status.as_u16(), location.as_str()));
        }

        if !status.is_success() {
            return Err(classify_status(status));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().to_string();
        let body = response.bytes().await.map_err(|e| classify_error(&e))?;

        let page = Page::new(final_url, status.as_u16(), body.to_vec());
        Ok(match content_type {
            Some(content_type) => page.with_content_type(content_type),
            None => page,
        })
    }

    fn visit(
        &self,
        datum: &CrawlDatum,
        page: &Page,
        next: &mut Vec<CrawlDatum>,
    ) -> Result<(), FetchError> {
        let is_html = page
            .content_type
            .as_deref()
            .map_or(true, |ct| ct.contains("text/html"));
        if !is_html {
            return Ok(());
        }

        let base = Url::parse(&page.url).map_err(|e| FetchError::gone(e.to_string()))?;
        for link in extract_links(&page.text(), &base) {
            if self.same_host_only && !is_same_host(&link, &base) {
                continue;
            }
            next.push(datum.child(link));
        }
        Ok(())
    }
}
