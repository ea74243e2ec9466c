//! Link extraction for the HTTP visitor
//!
//! Collects the outlinks of an HTML page as absolute http(s) URLs, in
//! document order and without duplicates.

use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Extracts the links of an HTML document
///
/// # Link Extraction Rules
///
/// **Include:**
/// - `<a href="...">` tags
/// - `<link rel="canonical" href="...">`
///
/// **Exclude:**
/// - `<a href="..." download>`
/// - `javascript:`, `mailto:`, `tel:` and `data:` links
/// - Fragment-only links
/// - Anything that does not resolve to an http(s) URL
///
/// Fragments are stripped, so `page#a` and `page#b` are the same link.
pub fn extract_links(html: &str, base_url: &Url) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    let mut push = |href: &str| {
        if let Some(url) = resolve_link(href, base_url) {
            if seen.insert(url.clone()) {
                links.push(url);
            }
        }
    };

    if let Ok(a_selector) = Selector::parse("a[href]") {
        for element in document.select(&a_selector) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(href) = element.value().attr("href") {
                push(href);
            }
        }
    }

    if let Ok(canonical_selector) = Selector::parse("link[rel='canonical'][href]") {
        for element in document.select(&canonical_selector) {
            if let Some(href) = element.value().attr("href") {
                push(href);
            }
        }
    }

    links
}

/// Resolves an href against the page URL
///
/// Returns None if the link should be excluded.
fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| href.starts_with(scheme))
    {
        return None;
    }

    let mut absolute_url = base_url.join(href).ok()?;
    if absolute_url.scheme() != "http" && absolute_url.scheme() != "https" {
        return None;
    }
    absolute_url.set_fragment(None);
    Some(absolute_url.to_string())
}

/// Returns true if `link` is on the same host as `base_url`
pub fn is_same_host(link: &str, base_url: &Url) -> bool {
    Url::parse(link)
        .map(|url| url.host_str() == base_url.host_str())
        .unwrap_or(false)
}
