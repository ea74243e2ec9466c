/// Status definitions for crawl datums
///
/// This module defines the statuses a datum can be in, the priority order used
/// when merging conflicting facts about the same key, and the transient
/// injection requests that are folded away during a merge.
use serde::{Deserialize, Serialize};
use std::fmt;

/// The observed state of a URL in the crawl database
///
/// Variants are declared in merge priority order, so the derived `Ord` is the
/// priority order: a higher status wins a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Known but never successfully fetched
    Unfetched,

    /// Fetched, but the content was not visited (e.g. an unfollowed redirect)
    Fetched,

    /// Permanently unavailable (HTTP 404/410 and the like)
    Gone,

    /// Last attempt failed with a transient error
    Retry,

    /// Fetched and visited
    Success,
}

impl Status {
    /// Numeric merge priority (1 = lowest)
    pub fn priority(&self) -> u8 {
        match self {
            Self::Unfetched => 1,
            Self::Fetched => 2,
            Self::Gone => 3,
            Self::Retry => 4,
            Self::Success => 5,
        }
    }

    /// Returns true if the default generator will offer a datum in this status
    pub fn is_fetchable(&self) -> bool {
        matches!(self, Self::Unfetched | Self::Retry)
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Unfetched => "unfetched",
            Self::Fetched => "fetched",
            Self::Gone => "gone",
            Self::Retry => "retry",
            Self::Success => "success",
        }
    }

    /// Parses a status from its database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "unfetched" => Some(Self::Unfetched),
            "fetched" => Some(Self::Fetched),
            "gone" => Some(Self::Gone),
            "retry" => Some(Self::Retry),
            "success" => Some(Self::Success),
            _ => None,
        }
    }

    /// Returns all statuses in priority order
    pub fn all_statuses() -> [Self; 5] {
        [
            Self::Unfetched,
            Self::Fetched,
            Self::Gone,
            Self::Retry,
            Self::Success,
        ]
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// A request to (re)introduce a key into the crawl database
///
/// Injections only ever exist as merge candidates. A merge rewrites the
/// winning candidate to `Status::Unfetched` before it is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Injection {
    /// Add the key if it is not already known
    Inject,

    /// Reset the key to unfetched, overriding everything else known about it
    ForcedInject,
}

impl Injection {
    pub fn from_force(force: bool) -> Self {
        if force {
            Self::ForcedInject
        } else {
            Self::Inject
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, Self::ForcedInject)
    }

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Inject => "inject",
            Self::ForcedInject => "forced_inject",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "inject" => Some(Self::Inject),
            "forced_inject" => Some(Self::ForcedInject),
            _ => None,
        }
    }
}

/// The status of a merge candidate: either an observed fact or a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateStatus {
    Observed(Status),
    Requested(Injection),
}

impl CandidateStatus {
    /// The status this candidate commits as, with requests rewritten to `Unfetched`
    pub fn committed(&self) -> Status {
        match self {
            Self::Observed(status) => *status,
            Self::Requested(_) => Status::Unfetched,
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, Self::Requested(Injection::ForcedInject))
    }
}
