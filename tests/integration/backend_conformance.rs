//! Behaviour every storage backend must share
//!
//! Each check is a generic function instantiated for the SQLite and the
//! memory backend by `conformance_tests!`.

use chrono::{DateTime, TimeZone, Utc};
use ripple_crawldb::crawler::{FilterChain, Generator};
use ripple_crawldb::storage::{share, MemoryBackend, SharedBackend, SqliteBackend, StorageBackend};
use ripple_crawldb::{CrawlDatum, Status};
use std::sync::Arc;
use tempfile::TempDir;

fn url(n: usize) -> String {
    format!("https://example.com/page/{:03}", n)
}

fn sqlite_backend() -> (SqliteBackend, Option<TempDir>) {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(dir.path().join("crawl"));
    (backend, Some(dir))
}

fn memory_backend() -> (MemoryBackend, Option<TempDir>) {
    (MemoryBackend::new(), None)
}

/// Writes `fetched` and `parsed` into a fresh segment and closes it
fn write_segment<B: StorageBackend>(backend: &mut B, fetched: &[CrawlDatum], parsed: &[CrawlDatum]) {
    backend.init_segment_writer().unwrap();
    for datum in fetched {
        backend.write_fetch_segment(datum).unwrap();
    }
    backend.write_parse_segment(parsed).unwrap();
    backend.close_segment_writer().unwrap();
}

fn snapshot<B: StorageBackend>(backend: &B) -> Vec<CrawlDatum> {
    backend.scan(None, usize::MAX).unwrap()
}

fn seed<B: StorageBackend>(backend: &mut B, urls: impl IntoIterator<Item = String>) {
    for url in urls {
        backend.inject(&CrawlDatum::new(url), false).unwrap();
    }
    backend.merge().unwrap();
}

fn check_unique_keys<B: StorageBackend>(mut backend: B) {
    backend.open().unwrap();
    assert!(backend.inject(&CrawlDatum::new(url(1)), false).unwrap());
    assert!(!backend.inject(&CrawlDatum::new(url(1)), false).unwrap());
    backend.merge().unwrap();
    assert!(!backend.inject(&CrawlDatum::new(url(1)), false).unwrap());

    let parsed = vec![CrawlDatum::new(url(1)), CrawlDatum::new(url(2))];
    write_segment(&mut backend, &[], &parsed);
    write_segment(&mut backend, &[], &parsed);
    let stats = backend.merge().unwrap();

    assert_eq!(stats.segments, 2);
    assert_eq!(stats.total_keys, 2);
    let keys: Vec<_> = snapshot(&backend).into_iter().map(|d| d.key).collect();
    assert_eq!(keys, [url(1), url(2)]);
}

fn check_forced_injection_dominates<B: StorageBackend>(mut backend: B) {
    backend.open().unwrap();
    seed(&mut backend, [url(1)]);

    let mut done = CrawlDatum::new(url(1));
    done.record_success(Utc::now());
    write_segment(&mut backend, &[done.clone()], &[]);
    backend.merge().unwrap();
    assert_eq!(backend.get(&url(1)).unwrap().unwrap().status, Status::Success);

    // A successful fetch observed in the same merge still loses to the forced request.
    write_segment(&mut backend, &[done], &[]);
    assert!(backend.inject(&CrawlDatum::new(url(1)), true).unwrap());
    let stats = backend.merge().unwrap();

    assert_eq!(stats.forced, 1);
    let stored = backend.get(&url(1)).unwrap().unwrap();
    assert_eq!(stored.status, Status::Unfetched);
    assert_eq!(stored.retry, 0);
}

fn check_status_never_regresses<B: StorageBackend>(mut backend: B) {
    backend.open().unwrap();
    seed(&mut backend, [url(1), url(2)]);

    let mut failed = CrawlDatum::new(url(1));
    failed.record_retry(Utc::now());
    let mut done = CrawlDatum::new(url(2));
    done.record_success(Utc::now());
    write_segment(&mut backend, &[failed, done], &[]);
    backend.merge().unwrap();

    // Rediscovered as outlinks: lower priority than what is committed.
    write_segment(
        &mut backend,
        &[],
        &[CrawlDatum::new(url(1)), CrawlDatum::new(url(2))],
    );
    backend.merge().unwrap();

    let first = backend.get(&url(1)).unwrap().unwrap();
    assert_eq!(first.status, Status::Retry);
    assert_eq!(first.retry, 1);
    assert_eq!(first.execute_count, 1);
    assert_eq!(backend.get(&url(2)).unwrap().unwrap().status, Status::Success);
}

fn check_empty_merge_changes_nothing<B: StorageBackend>(mut backend: B) {
    backend.open().unwrap();
    seed(&mut backend, (0..5).map(url));
    let mut done = CrawlDatum::new(url(0)).with_type("list");
    done.record_success(Utc::now());
    write_segment(&mut backend, &[done], &[CrawlDatum::new(url(9))]);
    backend.merge().unwrap();

    let before = snapshot(&backend);
    let stats = backend.merge().unwrap();
    assert_eq!(stats.segments, 0);
    assert_eq!(stats.new_keys, 0);
    assert_eq!(stats.updated_keys, 0);
    assert_eq!(snapshot(&backend), before);
}

fn check_retry_exhaustion<B: StorageBackend + 'static>(mut backend: B) {
    const MAX_RETRY: u32 = 2;

    backend.open().unwrap();
    seed(&mut backend, [url(1)]);
    let backend = share(backend);

    for attempt in 1..=MAX_RETRY + 1 {
        let mut generator = Generator::new(
            Arc::clone(&backend),
            FilterChain::standard(MAX_RETRY, None),
            None,
        );
        let mut datum = generator
            .next()
            .unwrap()
            .unwrap_or_else(|| panic!("datum not offered on attempt {}", attempt));
        datum.record_retry(Utc::now());

        let mut backend = backend.lock().unwrap();
        write_segment(&mut *backend, &[datum], &[]);
        backend.merge().unwrap();
    }

    let mut generator = Generator::new(
        Arc::clone(&backend),
        FilterChain::standard(MAX_RETRY, None),
        None,
    );
    assert!(generator.next().unwrap().is_none());

    let backend = backend.lock().unwrap();
    assert_eq!(backend.get(&url(1)).unwrap().unwrap().retry, MAX_RETRY + 1);
    assert_eq!(backend.count_given_up(MAX_RETRY, None).unwrap(), 1);
}

/// Generates the next datum, applies `outcome` to it and merges the result
///
/// Returns false if nothing was offered.
fn attempt_once<B: StorageBackend>(
    backend: &SharedBackend<B>,
    max_retry: u32,
    outcome: fn(&mut CrawlDatum, DateTime<Utc>),
) -> bool {
    let mut generator = Generator::new(
        Arc::clone(backend),
        FilterChain::standard(max_retry, None),
        None,
    );
    let Some(mut datum) = generator.next().unwrap() else {
        return false;
    };
    outcome(&mut datum, Utc::now());

    let mut backend = backend.lock().unwrap();
    write_segment(&mut *backend, &[datum], &[]);
    backend.merge().unwrap();
    true
}

fn check_gone_after_retry_exhausts<B: StorageBackend + 'static>(mut backend: B) {
    const MAX_RETRY: u32 = 2;

    backend.open().unwrap();
    seed(&mut backend, [url(1)]);
    let backend = share(backend);

    assert!(attempt_once(&backend, MAX_RETRY, CrawlDatum::record_retry));
    assert!(attempt_once(&backend, MAX_RETRY, CrawlDatum::record_gone));
    assert!(attempt_once(&backend, MAX_RETRY, CrawlDatum::record_gone));
    assert!(!attempt_once(&backend, MAX_RETRY, CrawlDatum::record_gone));

    let backend = backend.lock().unwrap();
    let datum = backend.get(&url(1)).unwrap().unwrap();
    assert_eq!(datum.status, Status::Retry);
    assert_eq!(datum.retry, MAX_RETRY + 1);
    assert_eq!(datum.execute_count, 3);
    assert_eq!(backend.count_given_up(MAX_RETRY, None).unwrap(), 1);
}

fn check_top_n_boundary<B: StorageBackend + 'static>(mut backend: B) {
    backend.open().unwrap();
    seed(&mut backend, (0..12).map(url));
    let backend = share(backend);

    let count = |top_n: Option<usize>| {
        let mut generator = Generator::new(
            Arc::clone(&backend),
            FilterChain::standard(3, None),
            top_n,
        )
        .with_page_size(5);
        let mut generated = 0;
        while generator.next().unwrap().is_some() {
            generated += 1;
        }
        generated
    };

    assert_eq!(count(Some(7)), 7);
    assert_eq!(count(Some(12)), 12);
    assert_eq!(count(None), 12);
}

fn check_segments_survive_interruption<B: StorageBackend>(mut backend: B) {
    backend.open().unwrap();
    seed(&mut backend, [url(1)]);

    let mut done = CrawlDatum::new(url(1));
    done.record_success(Utc::now());
    backend.init_segment_writer().unwrap();
    backend.write_fetch_segment(&done).unwrap();
    backend.write_parse_segment(&[CrawlDatum::new(url(2))]).unwrap();
    // Interrupted before the segment was closed or merged.
    backend.close().unwrap();

    backend.open().unwrap();
    assert_eq!(backend.pending_segments().unwrap().len(), 1);
    assert_eq!(backend.get(&url(1)).unwrap().unwrap().status, Status::Unfetched);

    let stats = backend.merge().unwrap();
    assert_eq!(stats.segments, 1);
    assert!(backend.pending_segments().unwrap().is_empty());
    assert_eq!(backend.get(&url(1)).unwrap().unwrap().status, Status::Success);
    assert_eq!(backend.get(&url(2)).unwrap().unwrap().status, Status::Unfetched);
}

fn check_lock_record<B: StorageBackend>(mut backend: B) {
    backend.open().unwrap();
    assert!(!backend.is_locked().unwrap());

    backend.lock(Some("abc123")).unwrap();
    let record = backend.lock_record().unwrap();
    assert!(record.locked);
    assert!(record.locked_at.is_some());
    assert_eq!(record.config_hash.as_deref(), Some("abc123"));

    // A crash leaves the lock behind.
    backend.close().unwrap();
    backend.open().unwrap();
    assert!(backend.is_locked().unwrap());

    backend.unlock().unwrap();
    assert!(!backend.is_locked().unwrap());
}

fn check_closed_backend_refuses_work<B: StorageBackend>(mut backend: B) {
    assert!(!backend.is_open());
    assert!(backend.get(&url(1)).is_err());
    assert!(backend.inject(&CrawlDatum::new(url(1)), false).is_err());
    assert!(backend.merge().is_err());
}

fn check_merge_refused_while_writing<B: StorageBackend>(mut backend: B) {
    backend.open().unwrap();
    backend.init_segment_writer().unwrap();
    assert!(backend.init_segment_writer().is_err());
    assert!(backend.merge().is_err());
    backend.close_segment_writer().unwrap();
    assert!(backend.merge().is_ok());
}

macro_rules! conformance_tests {
    ($name:ident, $make:expr) => {
        mod $name {
            use super::*;

            #[test]
            fn unique_keys() {
                let (backend, _dir) = $make;
                check_unique_keys(backend);
            }

            #[test]
            fn forced_injection_dominates() {
                let (backend, _dir) = $make;
                check_forced_injection_dominates(backend);
            }

            #[test]
            fn status_never_regresses() {
                let (backend, _dir) = $make;
                check_status_never_regresses(backend);
            }

            #[test]
            fn empty_merge_changes_nothing() {
                let (backend, _dir) = $make;
                check_empty_merge_changes_nothing(backend);
            }

            #[test]
            fn gone_after_retry_exhausts() {
                let (backend, _dir) = $make;
                check_gone_after_retry_exhausts(backend);
            }

            #[test]
            fn retry_exhaustion() {
                let (backend, _dir) = $make;
                check_retry_exhaustion(backend);
            }

            #[test]
            fn top_n_boundary() {
                let (backend, _dir) = $make;
                check_top_n_boundary(backend);
            }

            #[test]
            fn segments_survive_interruption() {
                let (backend, _dir) = $make;
                check_segments_survive_interruption(backend);
            }

            #[test]
            fn lock_record() {
                let (backend, _dir) = $make;
                check_lock_record(backend);
            }

            #[test]
            fn closed_backend_refuses_work() {
                let (backend, _dir) = $make;
                check_closed_backend_refuses_work(backend);
            }

            #[test]
            fn merge_refused_while_writing() {
                let (backend, _dir) = $make;
                check_merge_refused_while_writing(backend);
            }
        }
    };
}

conformance_tests!(sqlite, sqlite_backend());
conformance_tests!(memory, memory_backend());

fn at(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
}

/// Leaves a committed snapshot, two unmerged segments and a staged forced
/// injection behind, using fixed timestamps
fn stage_merge_inputs<B: StorageBackend>(backend: &mut B) {
    backend.open().unwrap();
    seed(backend, (0..4).map(url));

    let mut done = CrawlDatum::new(url(0)).with_type("list");
    done.record_success(at(1));
    let mut failed = CrawlDatum::new(url(1));
    failed.record_retry(at(1));
    write_segment(
        backend,
        &[done.clone(), failed.clone()],
        &[done.child(url(7)), done.child(url(1))],
    );

    let mut gone = CrawlDatum::new(url(2));
    gone.record_gone(at(2));
    failed.record_gone(at(2));
    write_segment(backend, &[gone, failed], &[CrawlDatum::new(url(8))]);

    backend.inject(&CrawlDatum::new(url(3)), true).unwrap();
}

fn assert_merges_agree<B: StorageBackend>(mut first: B, mut second: B) {
    assert_eq!(first.pending_segments().unwrap().len(), 2);
    assert_eq!(snapshot(&first), snapshot(&second));

    let first_stats = first.merge().unwrap();
    let second_stats = second.merge().unwrap();
    assert_eq!(first_stats, second_stats);

    let merged = snapshot(&first);
    assert_eq!(merged, snapshot(&second));
    assert_eq!(merged.len(), 6);

    let failed = first.get(&url(1)).unwrap().unwrap();
    assert_eq!(failed.status, Status::Retry);
    assert_eq!(failed.retry, 2);
    assert_eq!(failed.execute_count, 2);
    assert_eq!(failed.fetch_time, Some(at(2)));
    assert_eq!(first.get(&url(2)).unwrap().unwrap().status, Status::Gone);
    assert_eq!(first.get(&url(3)).unwrap().unwrap().status, Status::Unfetched);
    assert_eq!(first.get(&url(7)).unwrap().unwrap().depth(), 1);
}

#[test]
fn sqlite_merge_of_copied_inputs_is_identical() {
    let dir = TempDir::new().unwrap();
    let original_path = dir.path().join("original");
    let copy_path = dir.path().join("copy");

    let mut original = SqliteBackend::new(&original_path);
    stage_merge_inputs(&mut original);
    original.close().unwrap();

    std::fs::create_dir_all(&copy_path).unwrap();
    for entry in std::fs::read_dir(&original_path).unwrap() {
        let entry = entry.unwrap();
        std::fs::copy(entry.path(), copy_path.join(entry.file_name())).unwrap();
    }

    let mut copy = SqliteBackend::new(&copy_path);
    original.open().unwrap();
    copy.open().unwrap();
    assert_merges_agree(original, copy);
}

#[test]
fn memory_merge_of_same_inputs_is_identical() {
    let mut first = MemoryBackend::new();
    let mut second = MemoryBackend::new();
    stage_merge_inputs(&mut first);
    stage_merge_inputs(&mut second);
    assert_merges_agree(first, second);
}
