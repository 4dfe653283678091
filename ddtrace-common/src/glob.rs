// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Glob patterns as used by sampling rules, desugared to anchored
//! case-insensitive regular expressions: `?` matches any single character,
//! `*` any run of characters, everything else literally.

use regex::Regex;

/// A compiled glob matcher. `None` inside means match-any: empty patterns
/// and a bare `*` are treated as wildcards without paying for a regex.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    pattern: String,
    regex: Option<Regex>,
}

impl GlobMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        if pattern.is_empty() || pattern == "*" {
            return Ok(GlobMatcher {
                pattern: pattern.to_string(),
                regex: None,
            });
        }

        let mut source = String::with_capacity(pattern.len() + 8);
        source.push_str("(?i)^");
        for c in pattern.chars() {
            match c {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                _ => source.push_str(&regex::escape(&c.to_string())),
            }
        }
        source.push('$');

        Ok(GlobMatcher {
            pattern: pattern.to_string(),
            regex: Some(Regex::new(&source)?),
        })
    }

    pub fn is_match(&self, input: &str) -> bool {
        match &self.regex {
            None => true,
            Some(regex) => regex.is_match(input),
        }
    }

    /// True when the pattern matches everything.
    pub fn is_match_any(&self) -> bool {
        self.regex.is_none()
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_star_match_everything() {
        for pattern in ["", "*"] {
            let matcher = GlobMatcher::new(pattern).unwrap();
            assert!(matcher.is_match_any());
            assert!(matcher.is_match(""));
            assert!(matcher.is_match("anything at all"));
        }
    }

    #[test]
    fn question_mark_matches_single_char() {
        let matcher = GlobMatcher::new("web?server").unwrap();
        assert!(matcher.is_match("web-server"));
        assert!(matcher.is_match("web_server"));
        assert!(!matcher.is_match("webserver"));
        assert!(!matcher.is_match("web--server"));
    }

    #[test]
    fn star_matches_runs() {
        let matcher = GlobMatcher::new("GET /users/*").unwrap();
        assert!(matcher.is_match("GET /users/123"));
        assert!(matcher.is_match("GET /users/"));
        assert!(!matcher.is_match("POST /users/123"));
    }

    #[test]
    fn matching_is_case_insensitive() {
        let matcher = GlobMatcher::new("http.request").unwrap();
        assert!(matcher.is_match("HTTP.Request"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let matcher = GlobMatcher::new("a.b+c(d)").unwrap();
        assert!(matcher.is_match("a.b+c(d)"));
        assert!(!matcher.is_match("aXb+c(d)"));
        assert!(!matcher.is_match("a.bbc(d)"));
    }
}
