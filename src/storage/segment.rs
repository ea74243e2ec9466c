//! Segment naming
//!
//! A segment is named after the wall-clock time it was created at, rendered
//! as a fixed-width `YYYYMMDDhhmmssSSS` string so that lexical order is
//! creation order. When two segments would get the same name (or the clock
//! goes backwards) the new name is bumped past the last one.

use chrono::{DateTime, Utc};
use std::fmt;

const NAME_FORMAT: &str = "%Y%m%d%H%M%S%3f";
const NAME_LEN: usize = 17;

/// Unique, ordered name of one iteration's segment
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentName(String);

impl SegmentName {
    /// Creates the name for a segment started at `now`, strictly after `last`
    pub fn next(now: DateTime<Utc>, last: Option<&SegmentName>) -> Self {
        let candidate = Self(now.format(NAME_FORMAT).to_string());
        match last {
            Some(last) if candidate <= *last => last.successor(),
            _ => candidate,
        }
    }

    /// Wraps a stored name, rejecting anything that is not a segment name
    pub fn parse(name: &str) -> Option<Self> {
        if name.len() == NAME_LEN && name.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(name.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn successor(&self) -> Self {
        // All-digit names of fixed width: numeric increment keeps lexical order.
        let value: u64 = self.0.parse().unwrap_or(0);
        Self(format!("{:0width$}", value + 1, width = NAME_LEN))
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
