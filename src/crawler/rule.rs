//! URL rules for bounding a crawl
//!
//! A `RegexRule` holds positive and negative patterns. A URL satisfies the
//! rule when it matches at least one positive pattern and no negative one.
//! Patterns must match the whole URL.

use crate::crawler::visitor::NextFilter;
use crate::state::CrawlDatum;
use regex::Regex;

/// Positive and negative URL patterns
///
/// Rules are written as strings: `-pattern` is negative, `+pattern` or a
/// bare `pattern` is positive.
#[derive(Debug, Clone, Default)]
pub struct RegexRule {
    positive: Vec<Regex>,
    negative: Vec<Regex>,
}

impl RegexRule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a rule from a list of rule strings
    pub fn from_rules<I, S>(rules: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rule = Self::new();
        for r in rules {
            rule.add_rule(r.as_ref())?;
        }
        Ok(rule)
    }

    /// Adds one rule string; empty strings are ignored
    pub fn add_rule(&mut self, rule: &str) -> Result<&mut Self, regex::Error> {
        if let Some(pattern) = rule.strip_prefix('-') {
            self.negative.push(whole_match(pattern)?);
        } else if let Some(pattern) = rule.strip_prefix('+') {
            self.positive.push(whole_match(pattern)?);
        } else if !rule.is_empty() {
            self.positive.push(whole_match(rule)?);
        }
        Ok(self)
    }

    /// True if the rule has no positive pattern (it then accepts nothing)
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty()
    }

    /// Returns true if `url` matches a positive pattern and no negative one
    pub fn satisfy(&self, url: &str) -> bool {
        !self.negative.iter().any(|re| re.is_match(url))
            && self.positive.iter().any(|re| re.is_match(url))
    }
}

fn whole_match(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

impl NextFilter for RegexRule {
    fn filter(&self, next: CrawlDatum, _parent: &CrawlDatum) -> Option<CrawlDatum> {
        next.matches_rule(self).then_some(next)
    }
}
