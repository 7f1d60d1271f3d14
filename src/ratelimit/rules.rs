//! Rate limit rules and path matching.
//!
//! A rule maps a request path pattern to a limit over a sliding window. Patterns are
//! either exact paths (`/health`) or prefixes ending in the wildcard marker (`/api/*`).
//! Matching is by specificity: the longest matched prefix wins, regardless of the order
//! rules were configured in.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{FlowGuardError, Result};

/// Marker that turns a pattern into a prefix match.
pub const WILDCARD: char = '*';

/// Longest accepted window: 365 days.
pub const MAX_WINDOW_SECS: u64 = 365 * 24 * 60 * 60;

/// A single rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Exact path, or prefix followed by `*`
    pub path: String,
    /// Requests admitted per window
    pub limit: u64,
    /// Window length in seconds
    pub window: u64,
}

impl Rule {
    pub fn new(path: impl Into<String>, limit: u64, window: u64) -> Self {
        Self {
            path: path.into(),
            limit,
            window,
        }
    }

    /// Window length as a `Duration`.
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window)
    }

    pub fn is_wildcard(&self) -> bool {
        self.path.ends_with(WILDCARD)
    }

    /// Length of the matched prefix if this rule applies to `path`.
    ///
    /// Exact matches count the full pattern; wildcard matches count the prefix without
    /// the marker.
    pub fn match_len(&self, path: &str) -> Option<usize> {
        if self.path == path {
            return Some(self.path.len());
        }

        let prefix = self.path.strip_suffix(WILDCARD)?;
        path.starts_with(prefix).then_some(prefix.len())
    }

    /// Check that the rule can be served.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_empty() {
            return Err(FlowGuardError::Config("rule path must not be empty".into()));
        }
        if self.path.trim_end_matches(WILDCARD).contains(WILDCARD)
            || self.path.ends_with("**")
        {
            return Err(FlowGuardError::Config(format!(
                "rule '{}': wildcard is only allowed as the final character",
                self.path
            )));
        }
        if self.limit == 0 {
            return Err(FlowGuardError::Config(format!(
                "rule '{}': limit must be positive",
                self.path
            )));
        }
        if self.window == 0 {
            return Err(FlowGuardError::Config(format!(
                "rule '{}': window must be positive",
                self.path
            )));
        }
        if self.window > MAX_WINDOW_SECS {
            return Err(FlowGuardError::Config(format!(
                "rule '{}': window must not exceed {} seconds",
                self.path, MAX_WINDOW_SECS
            )));
        }
        Ok(())
    }
}

/// The immutable set of configured rules.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    /// Build a table, rejecting any invalid rule.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        for rule in &rules {
            rule.validate()?;
        }
        Ok(Self { rules })
    }

    /// Load rules from a YAML file containing a list of rules.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML list.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: Vec<Rule> = serde_yaml::from_str(yaml)
            .map_err(|e| FlowGuardError::Config(format!("Failed to parse rules: {}", e)))?;
        Self::new(rules)
    }

    /// Find the most specific rule for a request path.
    ///
    /// Ties keep the rule that appears first in the table.
    pub fn resolve(&self, path: &str) -> Option<&Rule> {
        let mut best: Option<(usize, &Rule)> = None;

        for rule in &self.rules {
            let Some(len) = rule.match_len(path) else {
                continue;
            };
            match best {
                Some((best_len, _)) if best_len >= len => {}
                _ => best = Some((len, rule)),
            }
        }

        best.map(|(_, rule)| rule)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rules: &[(&str, u64, u64)]) -> RuleTable {
        RuleTable::new(
            rules
                .iter()
                .map(|(p, l, w)| Rule::new(*p, *l, *w))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_rules() {
        let yaml = r#"
- path: /api/*
  limit: 5
  window: 10
- path: /health
  limit: 1000
  window: 1
"#;
        let rules = RuleTable::from_yaml(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules.rules()[0], Rule::new("/api/*", 5, 10));
    }

    #[test]
    fn test_exact_beats_wildcard() {
        let rules = table(&[("/*", 1, 60), ("/health", 1000, 1)]);

        let rule = rules.resolve("/health").unwrap();
        assert_eq!(rule.path, "/health");
        assert_eq!(rule.limit, 1000);

        let rule = rules.resolve("/other").unwrap();
        assert_eq!(rule.path, "/*");
    }

    #[test]
    fn test_longest_prefix_wins() {
        let rules = table(&[("/api/*", 100, 1), ("/api/v1/users/*", 5, 1), ("/api/v1/*", 50, 1)]);

        assert_eq!(rules.resolve("/api/v1/users/42").unwrap().limit, 5);
        assert_eq!(rules.resolve("/api/v1/orders").unwrap().limit, 50);
        assert_eq!(rules.resolve("/api/v2").unwrap().limit, 100);
    }

    #[test]
    fn test_wildcard_matches_bare_prefix() {
        let rules = table(&[("/api/*", 100, 1)]);

        assert!(rules.resolve("/api/").is_some());
        assert!(rules.resolve("/api").is_none());
    }

    #[test]
    fn test_exact_rule_does_not_prefix_match() {
        let rules = table(&[("/health", 10, 1)]);

        assert!(rules.resolve("/health").is_some());
        assert!(rules.resolve("/healthz").is_none());
        assert!(rules.resolve("/health/deep").is_none());
    }

    #[test]
    fn test_tie_keeps_first_rule() {
        let rules = table(&[("/a/*", 1, 1), ("/a/*", 2, 1)]);
        assert_eq!(rules.resolve("/a/b").unwrap().limit, 1);
    }

    #[test]
    fn test_exact_and_wildcard_of_same_length() {
        // exact "/ab" matches 3 characters; wildcard "/ab*" matches prefix "/ab", also 3
        let rules = table(&[("/ab", 1, 1), ("/ab*", 2, 1)]);
        assert_eq!(rules.resolve("/ab").unwrap().limit, 1);
        assert_eq!(rules.resolve("/abc").unwrap().limit, 2);
    }

    #[test]
    fn test_no_match() {
        let rules = table(&[("/api/*", 5, 10)]);
        assert!(rules.resolve("/static/app.js").is_none());

        let empty = RuleTable::default();
        assert!(empty.resolve("/anything").is_none());
    }

    #[test]
    fn test_catch_all_wildcard() {
        let rules = table(&[("*", 7, 1)]);
        assert_eq!(rules.resolve("/whatever").unwrap().limit, 7);
        assert_eq!(rules.resolve("").unwrap().limit, 7);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(RuleTable::new(vec![Rule::new("/a", 0, 1)]).is_err());
        assert!(RuleTable::new(vec![Rule::new("/a", 1, 0)]).is_err());
        assert!(RuleTable::new(vec![Rule::new("", 1, 1)]).is_err());
        assert!(RuleTable::new(vec![Rule::new("/a/*/b", 1, 1)]).is_err());
        assert!(RuleTable::new(vec![Rule::new("/a/**", 1, 1)]).is_err());

        let err = RuleTable::from_yaml("- path: /x\n  limit: 3\n  window: 0\n").unwrap_err();
        assert!(matches!(err, FlowGuardError::Config(_)));
    }

    #[test]
    fn test_oversized_window_rejected() {
        assert!(RuleTable::new(vec![Rule::new("/a", 1, MAX_WINDOW_SECS)]).is_ok());
        assert!(RuleTable::new(vec![Rule::new("/a", 1, MAX_WINDOW_SECS + 1)]).is_err());

        let err = RuleTable::new(vec![Rule::new("/api/*", 1, 10_000_000_000_000_000)]).unwrap_err();
        assert!(matches!(err, FlowGuardError::Config(_)));
    }

    #[test]
    fn test_window_duration() {
        assert_eq!(Rule::new("/a", 1, 10).window_duration(), Duration::from_secs(10));
    }
}
