//! End-to-end crawl tests
//!
//! Scripted visitors drive the crawl loop over a real SQLite crawl
//! database; the last test runs the bundled HTTP visitor against a
//! wiremock server.

use async_trait::async_trait;
use ripple_crawldb::config::{CrawlerConfig, HttpConfig};
use ripple_crawldb::crawler::{
    Crawler, FetchError, HttpVisitor, Page, RegexRule, StopHandle, Visitor,
};
use ripple_crawldb::storage::{MemoryBackend, SqliteBackend, StorageBackend};
use ripple_crawldb::{CrawlDatum, Status};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const A: &str = "https://example.com/a";
const B: &str = "https://example.com/b";
const C: &str = "https://example.com/c";

/// Counts fetches per URL and follows a fixed script
///
/// `/b` fails on its first attempt and links to `/c` once it succeeds.
/// When `stop_after` is set, the crawl is stopped after fetching that URL.
#[derive(Default)]
struct Scripted {
    fetches: Mutex<HashMap<String, usize>>,
    stop_after: Option<&'static str>,
    stop: OnceLock<StopHandle>,
    links: HashMap<&'static str, Vec<&'static str>>,
}

impl Scripted {
    fn with_links(mut self, from: &'static str, to: &[&'static str]) -> Self {
        self.links.insert(from, to.to_vec());
        self
    }

    fn fetch_count(&self, url: &str) -> usize {
        self.fetches.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Visitor for Scripted {
    async fn fetch(&self, datum: &CrawlDatum) -> Result<Page, FetchError> {
        let attempt = {
            let mut fetches = self.fetches.lock().unwrap();
            let count = fetches.entry(datum.url.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if self.stop_after == Some(datum.url.as_str()) {
            if let Some(stop) = self.stop.get() {
                stop.stop();
            }
        }
        if datum.url == B && attempt == 1 {
            return Err(FetchError::retry("connection reset"));
        }
        Ok(Page::new(&datum.url, 200, "<html></html>"))
    }

    fn visit(
        &self,
        datum: &CrawlDatum,
        _page: &Page,
        next: &mut Vec<CrawlDatum>,
    ) -> Result<(), FetchError> {
        if let Some(links) = self.links.get(datum.url.as_str()) {
            next.extend(links.iter().map(|link| datum.child(*link)));
        }
        Ok(())
    }
}

/// Lets a test keep a handle on a visitor the crawler owns
struct Shared(Arc<Scripted>);

#[async_trait]
impl Visitor for Shared {
    async fn fetch(&self, datum: &CrawlDatum) -> Result<Page, FetchError> {
        self.0.fetch(datum).await
    }

    fn visit(
        &self,
        datum: &CrawlDatum,
        page: &Page,
        next: &mut Vec<CrawlDatum>,
    ) -> Result<(), FetchError> {
        self.0.visit(datum, page, next)
    }
}

fn crawler_config(resumable: bool) -> CrawlerConfig {
    CrawlerConfig {
        threads: 2,
        max_retry: 3,
        resumable,
        ..CrawlerConfig::default()
    }
}

fn stored(crawl_path: &Path, url: &str) -> Option<CrawlDatum> {
    let mut backend = SqliteBackend::new(crawl_path);
    backend.open().unwrap();
    let datum = backend.get(url).unwrap();
    backend.close().unwrap();
    datum
}

#[tokio::test]
async fn test_retry_then_discover() {
    let dir = TempDir::new().unwrap();
    let crawl_path = dir.path().join("crawl");
    let visitor = Arc::new(Scripted::default().with_links(B, &[C]));

    let mut crawler = Crawler::new(
        SqliteBackend::new(&crawl_path),
        Shared(Arc::clone(&visitor)),
        crawler_config(true),
    );
    crawler.add_seeds([A, B], false);

    let first = crawler.start(1).await.unwrap();
    assert_eq!(first.injection.new_keys, 2);
    assert_eq!(first.iterations[0].generate.generated, 2);
    assert_eq!(first.iterations[0].fetch.retried, 1);
    assert_eq!(first.count(Status::Success), 1);
    assert_eq!(first.count(Status::Retry), 1);
    assert_eq!(stored(&crawl_path, B).unwrap().retry, 1);

    // The seeds are known now: only the failed key is offered again.
    let second = crawler.start(1).await.unwrap();
    assert_eq!(second.injection.new_keys, 0);
    assert_eq!(second.iterations[0].generate.generated, 1);
    assert_eq!(second.count(Status::Success), 2);
    assert_eq!(second.count(Status::Unfetched), 1);

    let b = stored(&crawl_path, B).unwrap();
    assert_eq!(b.status, Status::Success);
    assert_eq!(b.execute_count, 2);
    let c = stored(&crawl_path, C).unwrap();
    assert_eq!(c.status, Status::Unfetched);
    assert_eq!(c.depth(), 1);

    assert_eq!(visitor.fetch_count(A), 1);
    assert_eq!(visitor.fetch_count(B), 2);
    assert_eq!(visitor.fetch_count(C), 0);
}

#[tokio::test]
async fn test_crawl_to_depth() {
    let dir = TempDir::new().unwrap();
    let crawl_path = dir.path().join("crawl");
    let visitor = Scripted::default().with_links(A, &[B]).with_links(B, &[C]);

    let mut crawler = Crawler::new(SqliteBackend::new(&crawl_path), visitor, crawler_config(false));
    crawler.add_seed(A);
    let report = crawler.start(5).await.unwrap();

    // a, b (fails once), b again, c, then an empty round.
    let generated: Vec<_> = report
        .iterations
        .iter()
        .map(|i| i.generate.generated)
        .collect();
    assert_eq!(generated, [1, 1, 1, 1, 0]);
    assert_eq!(report.count(Status::Success), 3);
    assert!(!report.stopped);
    assert_eq!(report.given_up, 0);
    assert_eq!(stored(&crawl_path, C).unwrap().depth(), 2);
}

#[tokio::test]
async fn test_forced_seed_is_fetched_again() {
    let dir = TempDir::new().unwrap();
    let crawl_path = dir.path().join("crawl");
    let visitor = Arc::new(Scripted::default());

    let mut crawler = Crawler::new(
        SqliteBackend::new(&crawl_path),
        Shared(Arc::clone(&visitor)),
        crawler_config(true),
    );
    crawler.add_seed(A);
    crawler.start(2).await.unwrap();
    assert_eq!(visitor.fetch_count(A), 1);

    // A plain seed for a known key changes nothing.
    let report = crawler.start(1).await.unwrap();
    assert_eq!(report.total_generated(), 0);

    let mut forced = Crawler::new(
        SqliteBackend::new(&crawl_path),
        Shared(Arc::clone(&visitor)),
        crawler_config(true),
    );
    forced.add_forced_seed(A);
    let report = forced.start(1).await.unwrap();

    assert_eq!(report.injection.forced, 1);
    assert_eq!(report.total_generated(), 1);
    assert_eq!(visitor.fetch_count(A), 2);
    assert_eq!(stored(&crawl_path, A).unwrap().status, Status::Success);
}

#[tokio::test]
async fn test_fresh_crawl_clears_previous_state() {
    let dir = TempDir::new().unwrap();
    let crawl_path = dir.path().join("crawl");

    let mut crawler = Crawler::new(
        SqliteBackend::new(&crawl_path),
        Scripted::default().with_links(A, &[B]),
        crawler_config(true),
    );
    crawler.add_seed(A);
    crawler.start(1).await.unwrap();
    assert!(stored(&crawl_path, B).is_some());

    let mut fresh = Crawler::new(SqliteBackend::new(&crawl_path), Scripted::default(), crawler_config(false));
    fresh.add_seed(C);
    fresh.start(1).await.unwrap();

    assert!(stored(&crawl_path, A).is_none());
    assert!(stored(&crawl_path, B).is_none());
    assert_eq!(stored(&crawl_path, C).unwrap().status, Status::Success);
}

#[tokio::test]
async fn test_resume_after_stop() {
    let dir = TempDir::new().unwrap();
    let crawl_path = dir.path().join("crawl");
    let visitor = Arc::new(Scripted {
        stop_after: Some(A),
        ..Scripted::default().with_links(A, &[C])
    });

    let mut crawler = Crawler::new(
        SqliteBackend::new(&crawl_path),
        Shared(Arc::clone(&visitor)),
        CrawlerConfig {
            threads: 1,
            ..crawler_config(true)
        },
    );
    crawler.add_seed(A);
    visitor.stop.set(crawler.stop_handle()).unwrap();

    let stopped = crawler.start(3).await.unwrap();
    assert!(stopped.stopped);
    assert_eq!(stopped.iterations.len(), 1);
    // The interrupted iteration was still merged.
    assert_eq!(stopped.count(Status::Success), 1);
    assert_eq!(stopped.count(Status::Unfetched), 1);

    let resumed = crawler.start(3).await.unwrap();
    assert!(!resumed.stopped);
    assert_eq!(resumed.iterations[0].generate.generated, 1);
    assert_eq!(resumed.count(Status::Success), 2);
    assert_eq!(visitor.fetch_count(A), 1);
    assert_eq!(visitor.fetch_count(C), 1);
}

#[tokio::test]
async fn test_unclean_exit_is_resumed() {
    let dir = TempDir::new().unwrap();
    let crawl_path = dir.path().join("crawl");

    // A run that died after injecting and writing part of a segment.
    {
        let mut backend = SqliteBackend::new(&crawl_path);
        backend.open().unwrap();
        backend.lock(Some("old-hash")).unwrap();
        backend.inject(&CrawlDatum::new(A), false).unwrap();
        backend.merge().unwrap();
        backend.init_segment_writer().unwrap();
        backend
            .write_parse_segment(&[CrawlDatum::new(B)])
            .unwrap();
    }

    let mut crawler = Crawler::new(SqliteBackend::new(&crawl_path), Scripted::default(), crawler_config(true))
        .with_config_hash("new-hash");
    let report = crawler.start(1).await.unwrap();

    assert_eq!(report.injection.segments, 1);
    assert_eq!(report.injection.new_keys, 1);
    // b fails once on its first attempt.
    assert_eq!(report.count(Status::Success), 1);
    assert_eq!(report.count(Status::Retry), 1);

    let mut backend = SqliteBackend::new(&crawl_path);
    backend.open().unwrap();
    let record = backend.lock_record().unwrap();
    assert!(!record.locked);
    assert_eq!(record.config_hash.as_deref(), Some("new-hash"));
}

#[tokio::test]
async fn test_retry_limit_gives_up() {
    let config = CrawlerConfig {
        max_retry: 0,
        ..crawler_config(false)
    };
    let mut crawler = Crawler::new(MemoryBackend::new(), Scripted::default(), config);
    crawler.add_seeds([A, B], false);

    // b fails once and is never offered again.
    let report = crawler.start(5).await.unwrap();
    assert_eq!(report.iterations.len(), 2);
    assert_eq!(report.total_generated(), 2);
    assert_eq!(report.count(Status::Success), 1);
    assert_eq!(report.count(Status::Retry), 1);
    assert_eq!(report.given_up, 1);
}

/// Fails with a retryable error once, then reports the page gone for good
#[derive(Default)]
struct FlakyThenGone {
    fetches: Mutex<usize>,
}

#[async_trait]
impl Visitor for FlakyThenGone {
    async fn fetch(&self, _datum: &CrawlDatum) -> Result<Page, FetchError> {
        let mut fetches = self.fetches.lock().unwrap();
        *fetches += 1;
        if *fetches == 1 {
            Err(FetchError::retry("connection reset"))
        } else {
            Err(FetchError::gone("HTTP 404").with_code(404))
        }
    }

    fn visit(&self, _: &CrawlDatum, _: &Page, _: &mut Vec<CrawlDatum>) -> Result<(), FetchError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_gone_after_retry_is_given_up() {
    let config = CrawlerConfig {
        max_retry: 1,
        ..crawler_config(false)
    };
    let visitor = Arc::new(FlakyThenGone::default());
    let mut crawler = Crawler::new(MemoryBackend::new(), SharedFlaky(Arc::clone(&visitor)), config);
    crawler.add_seed(A);

    let report = crawler.start(8).await.unwrap();
    assert_eq!(*visitor.fetches.lock().unwrap(), 2);
    assert_eq!(report.total_generated(), 2);
    assert_eq!(report.count(Status::Retry), 1);
    assert_eq!(report.given_up, 1);
}

struct SharedFlaky(Arc<FlakyThenGone>);

#[async_trait]
impl Visitor for SharedFlaky {
    async fn fetch(&self, datum: &CrawlDatum) -> Result<Page, FetchError> {
        self.0.fetch(datum).await
    }

    fn visit(&self, datum: &CrawlDatum, page: &Page, next: &mut Vec<CrawlDatum>) -> Result<(), FetchError> {
        self.0.visit(datum, page, next)
    }
}

#[tokio::test]
async fn test_execute_count_limit() {
    let config = CrawlerConfig {
        max_execute_count: 1,
        ..crawler_config(false)
    };
    let mut crawler = Crawler::new(MemoryBackend::new(), Scripted::default(), config);
    crawler.add_seed(B);

    // One failed attempt is still within the limit.
    let report = crawler.start(5).await.unwrap();
    assert_eq!(report.total_generated(), 2);
    assert_eq!(report.count(Status::Success), 1);
    assert_eq!(report.given_up, 0);
}

#[tokio::test]
async fn test_url_rules_bound_the_crawl() {
    let dir = TempDir::new().unwrap();
    let crawl_path = dir.path().join("crawl");
    let visitor = Scripted::default().with_links(A, &[B, C, "https://example.com/a.png"]);
    let rule = RegexRule::from_rules([r"https://example\.com/.*", r"-.*/c", r"-.*\.png"]).unwrap();

    let mut crawler = Crawler::new(SqliteBackend::new(&crawl_path), visitor, crawler_config(false))
        .with_next_filter(rule);
    crawler.add_seed(A);
    let report = crawler.start(2).await.unwrap();

    assert_eq!(report.iterations[0].fetch.outlinks, 1);
    assert_eq!(stored(&crawl_path, B).unwrap().depth(), 1);
    assert!(stored(&crawl_path, C).is_none());
    assert!(stored(&crawl_path, "https://example.com/a.png").is_none());
}

#[tokio::test]
async fn test_http_visitor_crawl() {
    let server = MockServer::start().await;
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!(
                    r#"<html><head><title>Home</title></head><body>
                    <a href="/page">Page</a>
                    <a href="{base}/moved">Moved</a>
                    <a href="/missing">Missing</a>
                    <a href="/broken">Broken</a>
                    <a href="https://other.example/">Elsewhere</a>
                    </body></html>"#
                ))
                .insert_header("content-type", "text/html; charset=utf-8"),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><body>Leaf</body></html>")
                .insert_header("content-type", "text/html"),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/moved"))
        .respond_with(ResponseTemplate::new(301).insert_header("location", "/page"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let visitor = HttpVisitor::new(&HttpConfig {
        timeout_secs: 5,
        ..HttpConfig::default()
    })
    .unwrap();
    let mut crawler = Crawler::new(MemoryBackend::new(), visitor, crawler_config(false));
    crawler.add_seed_with_type(format!("{base}/"), "home");
    let report = crawler.start(2).await.unwrap();

    assert_eq!(report.iterations.len(), 2);
    let first = &report.iterations[0];
    assert_eq!(first.fetch.success, 1);
    assert_eq!(first.fetch.outlinks, 4);
    let second = &report.iterations[1];
    assert_eq!(second.generate.generated, 4);
    assert_eq!(second.fetch.success, 1);
    assert_eq!(second.fetch.redirected, 1);
    assert_eq!(second.fetch.gone, 1);
    assert_eq!(second.fetch.retried, 1);

    let mut backend = crawler.backend().lock().unwrap();
    assert!(!backend.is_open());
    backend.open().unwrap();
    let get = |url: String| backend.get(&url).unwrap().unwrap();

    let page = get(format!("{base}/page"));
    assert_eq!(page.status, Status::Success);
    assert_eq!(page.code, Some(200));
    assert_eq!(page.type_tag(), Some("home"));

    let moved = get(format!("{base}/moved"));
    assert_eq!(moved.status, Status::Fetched);
    assert_eq!(moved.code, Some(301));
    assert_eq!(moved.location, Some(format!("{base}/page")));

    let missing = get(format!("{base}/missing"));
    assert_eq!(missing.status, Status::Gone);
    assert_eq!(missing.code, Some(404));
    let broken = get(format!("{base}/broken"));
    assert_eq!(broken.status, Status::Retry);
    assert_eq!(broken.code, Some(500));
    assert_eq!(broken.retry, 1);

    assert!(backend.get("https://other.example/").unwrap().is_none());
}
