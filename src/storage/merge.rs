//! Conflict resolution for merges
//!
//! For every key a merge collects the candidate datums from the committed
//! snapshot, the pending segments and the staged injections, and keeps one.
//! Backends feed candidates oldest first; `resolve` is a pure function of
//! that sequence, which is what makes re-running a merge safe.

use crate::state::{CandidateStatus, CrawlDatum, Injection, Status};

/// One fact about a key, as seen by a merge
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub datum: CrawlDatum,
    pub status: CandidateStatus,
}

impl Candidate {
    /// A committed or segment datum
    pub fn observed(datum: CrawlDatum) -> Self {
        let status = CandidateStatus::Observed(datum.status);
        Self { datum, status }
    }

    /// A staged injection request
    pub fn requested(datum: CrawlDatum, injection: Injection) -> Self {
        Self {
            datum,
            status: CandidateStatus::Requested(injection),
        }
    }
}

/// The outcome of resolving one key
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The datum to commit; its status is always a persistent one
    pub datum: CrawlDatum,

    /// True if a forced injection overrode the other candidates
    pub forced: bool,
}

/// Picks the datum to commit from candidates ordered oldest first
///
/// - A forced injection wins outright; the newest one is taken and every
///   other candidate is discarded.
/// - Otherwise requests count as `Unfetched` and the highest status wins.
///   On equal status the later (newer) candidate wins.
/// - The winner keeps the highest `execute_count` and the latest
///   `fetch_time` seen among the candidates, so attempts that lost on
///   priority still count towards the execution limit.
/// - Unless the winner is `Success`, it also keeps the highest `retry`:
///   a failure that lost to an older `Retry` still counts against the
///   retry limit.
///
/// Returns `None` for an empty candidate list.
pub fn resolve<I>(candidates: I) -> Option<Resolution>
where
    I: IntoIterator<Item = Candidate>,
{
    let candidates: Vec<Candidate> = candidates.into_iter().collect();

    if let Some(forced) = candidates.iter().rev().find(|c| c.status.is_forced()) {
        let mut datum = forced.datum.clone();
        datum.status = forced.status.committed();
        return Some(Resolution {
            datum,
            forced: true,
        });
    }

    let max_execute_count = candidates.iter().map(|c| c.datum.execute_count).max();
    let max_retry = candidates.iter().map(|c| c.datum.retry).max();
    let latest_fetch_time = candidates.iter().filter_map(|c| c.datum.fetch_time).max();

    let winner = candidates
        .into_iter()
        .reduce(|best, next| {
            if next.status.committed() >= best.status.committed() {
                next
            } else {
                best
            }
        })?;

    let mut datum = winner.datum;
    datum.status = winner.status.committed();
    datum.execute_count = max_execute_count.unwrap_or(datum.execute_count);
    datum.fetch_time = latest_fetch_time.or(datum.fetch_time);
    if datum.status != Status::Success {
        datum.retry = max_retry.unwrap_or(datum.retry);
    }

    Some(Resolution {
        datum,
        forced: false,
    })
}

/// Counters reported by a merge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Segments folded into the snapshot
    pub segments: usize,

    /// Candidates read from segments and injections
    pub candidates: u64,

    /// Keys that were not in the previous snapshot
    pub new_keys: u64,

    /// Keys whose committed datum changed
    pub updated_keys: u64,

    /// Keys reset by a forced injection
    pub forced: u64,

    /// Keys in the new snapshot
    pub total_keys: u64,
}

impl MergeStats {
    /// Accounts for one resolved key
    ///
    /// `previous` is the datum the key had in the old snapshot, if any.
    pub fn record(&mut self, resolution: &Resolution, previous: Option<&CrawlDatum>) {
        self.total_keys += 1;
        if resolution.forced {
            self.forced += 1;
        }
        match previous {
            None => self.new_keys += 1,
            Some(previous) if previous != &resolution.datum => self.updated_keys += 1,
            Some(_) => {}
        }
    }
}
