// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling rules: user- or remotely-configured matchers paired with a rate
//! and an optional per-rule limiter.

use ddtrace_common::glob::GlobMatcher;
use ddtrace_common::rate_limiter::RateLimiter;
use ddtrace_trace_utils::span::Span;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    Trace,
    Span,
}

/// Where a rule came from. Remote rules win over local ones on hot swap, and
/// customer-configured remote rules rank above dynamically injected ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Provenance {
    Customer,
    Dynamic,
    Local,
}

#[derive(Debug)]
pub struct SamplingRule {
    service: GlobMatcher,
    name: GlobMatcher,
    resource: GlobMatcher,
    tags: Vec<(String, GlobMatcher)>,
    pub rate: f64,
    pub max_per_second: Option<f64>,
    limiter: Option<RateLimiter>,
    pub kind: RuleKind,
    pub provenance: Provenance,
}

impl Clone for SamplingRule {
    /// Cloning resets the per-rule limiter; a clone starts with a full
    /// token bucket.
    fn clone(&self) -> Self {
        SamplingRule {
            service: self.service.clone(),
            name: self.name.clone(),
            resource: self.resource.clone(),
            tags: self.tags.clone(),
            rate: self.rate,
            max_per_second: self.max_per_second,
            limiter: self.max_per_second.map(RateLimiter::new),
            kind: self.kind,
            provenance: self.provenance,
        }
    }
}

/// Render a metric the way tag matchers see it: integral values without a
/// decimal point.
fn stringify_metric(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl SamplingRule {
    pub fn new(
        service: &str,
        name: &str,
        resource: &str,
        tags: HashMap<String, String>,
        rate: f64,
        max_per_second: Option<f64>,
        kind: RuleKind,
        provenance: Provenance,
    ) -> Result<Self, regex::Error> {
        let mut tag_matchers = Vec::with_capacity(tags.len());
        for (key, pattern) in tags {
            tag_matchers.push((key, GlobMatcher::new(&pattern)?));
        }
        Ok(SamplingRule {
            service: GlobMatcher::new(service)?,
            name: GlobMatcher::new(name)?,
            resource: GlobMatcher::new(resource)?,
            tags: tag_matchers,
            rate,
            max_per_second,
            limiter: max_per_second.map(RateLimiter::new),
            kind,
            provenance,
        })
    }

    /// A rule matches when every non-empty matcher matches the corresponding
    /// span field. Tag matchers look at meta first, then at stringified
    /// metrics.
    pub fn matches(&self, span: &Span) -> bool {
        if !self.service.is_match(&span.service) {
            return false;
        }
        if !self.name.is_match(&span.name) {
            return false;
        }
        if !self.resource.is_match(&span.resource) {
            return false;
        }
        self.tags.iter().all(|(key, matcher)| {
            if let Some(value) = span.meta.get(key) {
                return matcher.is_match(value);
            }
            if let Some(value) = span.metrics.get(key) {
                return matcher.is_match(&stringify_metric(*value));
            }
            false
        })
    }

    /// Consult the per-rule limiter; rules without one always allow.
    pub fn allow_one(&self) -> (bool, f64) {
        match &self.limiter {
            None => (true, 1.0),
            Some(limiter) => {
                let result = limiter.allow_one();
                (result.allowed, result.effective_rate)
            }
        }
    }
}

/// Wire shape of one rule in a `sampling_rules` JSON array. Unknown fields
/// are rejected so typos surface as a skipped rule rather than a silently
/// widened match.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleJson {
    #[serde(default)]
    service: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    resource: String,
    #[serde(default)]
    tags: HashMap<String, String>,
    sample_rate: f64,
    #[serde(default)]
    max_per_second: Option<f64>,
}

/// Parse a JSON array of sampling rules. Invalid entries are skipped and
/// logged; they never fail the whole configuration.
pub fn parse_rules_json(json: &str, kind: RuleKind) -> Vec<SamplingRule> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(json) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(%error, "Ignoring sampling rules: not a JSON array");
            return Vec::new();
        }
    };

    let mut rules = Vec::with_capacity(entries.len());
    for entry in entries {
        let parsed: RuleJson = match serde_json::from_value(entry) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(%error, "Skipping invalid sampling rule");
                continue;
            }
        };
        if !(0.0..=1.0).contains(&parsed.sample_rate) {
            warn!(
                rate = parsed.sample_rate,
                "Skipping sampling rule with out-of-range rate"
            );
            continue;
        }
        match SamplingRule::new(
            &parsed.service,
            &parsed.name,
            &parsed.resource,
            parsed.tags,
            parsed.sample_rate,
            parsed.max_per_second,
            kind,
            Provenance::Local,
        ) {
            Ok(rule) => rules.push(rule),
            Err(error) => warn!(%error, "Skipping sampling rule with invalid pattern"),
        }
    }
    rules
}

/// An immutable snapshot of the configured rules. The engine swaps whole
/// snapshots; readers clone the `Arc` once per decision.
#[derive(Debug, Default)]
pub struct RuleSet {
    trace_rules: Vec<SamplingRule>,
    span_rules: Vec<SamplingRule>,
}

impl RuleSet {
    pub fn new(mut trace_rules: Vec<SamplingRule>, span_rules: Vec<SamplingRule>) -> Arc<Self> {
        // Stable sort: provenance rank decides between remote tiers, the
        // configured order decides within a tier.
        trace_rules.sort_by_key(|rule| rule.provenance);
        Arc::new(RuleSet {
            trace_rules,
            span_rules,
        })
    }

    pub fn trace_rules(&self) -> &[SamplingRule] {
        &self.trace_rules
    }

    pub fn span_rules(&self) -> &[SamplingRule] {
        &self.span_rules
    }

    pub fn is_empty(&self) -> bool {
        self.trace_rules.is_empty() && self.span_rules.is_empty()
    }

    /// First trace rule matching the span, in provenance-then-config order.
    pub fn match_trace_rule(&self, span: &Span) -> Option<&SamplingRule> {
        self.trace_rules.iter().find(|rule| rule.matches(span))
    }
}
