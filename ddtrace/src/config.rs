// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracer configuration. Invalid inputs are logged once and skipped; nothing
//! here is fatal.

use crate::propagation::PropagationStyle;
use ddtrace_common::parse_uri;
use ddtrace_sampling::rules::{parse_rules_json, RuleKind, SamplingRule};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

pub(crate) const TRACER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub(crate) const LANGUAGE: &str = "rust";

const DEFAULT_AGENT_URL: &str = "http://localhost:8126";

/// Resolved tracer configuration. Built through [`ConfigBuilder`], immutable
/// afterwards; the remotely swappable pieces live in the tracer, not here.
#[derive(Debug)]
pub struct Config {
    pub service: String,
    pub env: String,
    pub version: String,
    pub hostname: String,
    pub agent_url: hyper::Uri,
    /// Catch-all trace sample rate, applied after explicit rules.
    pub sample_rate: Option<f64>,
    /// Trace-rule keeps per second across the process.
    pub rate_limit: f64,
    pub trace_sampling_rules: Vec<SamplingRule>,
    pub span_sampling_rules: Vec<SamplingRule>,
    pub stats_computation: bool,
    pub debug_mode: bool,
    pub global_tags: HashMap<String, String>,
    pub service_mappings: HashMap<String, String>,
    /// `header -> tag` pairs applied when extracting HTTP carriers.
    pub header_tags: Vec<(String, String)>,
    pub propagation_styles_extract: Vec<PropagationStyle>,
    pub propagation_styles_inject: Vec<PropagationStyle>,
    /// Enables the abandoned-span debugger when set.
    pub span_timeout: Option<Duration>,
    pub flush_interval: Duration,
    pub send_retries: u32,
    pub git_commit_sha: String,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    service: Option<String>,
    env: Option<String>,
    version: Option<String>,
    hostname: Option<String>,
    agent_url: Option<String>,
    sample_rate: Option<f64>,
    rate_limit: Option<f64>,
    trace_sampling_rules: Option<String>,
    span_sampling_rules: Option<String>,
    stats_computation: Option<bool>,
    debug_mode: Option<bool>,
    global_tags: HashMap<String, String>,
    service_mappings: HashMap<String, String>,
    header_tags: Vec<(String, String)>,
    propagation_styles_extract: Option<Vec<String>>,
    propagation_styles_inject: Option<Vec<String>>,
    span_timeout: Option<Duration>,
    flush_interval: Option<Duration>,
    send_retries: Option<u32>,
    git_commit_sha: Option<String>,
}

impl ConfigBuilder {
    pub fn service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn env(mut self, env: &str) -> Self {
        self.env = Some(env.to_string());
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    pub fn agent_url(mut self, url: &str) -> Self {
        self.agent_url = Some(url.to_string());
        self
    }

    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate);
        self
    }

    pub fn rate_limit(mut self, limit: f64) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// JSON array of trace sampling rules.
    pub fn sampling_rules(mut self, json: &str) -> Self {
        self.trace_sampling_rules = Some(json.to_string());
        self
    }

    /// JSON array of single-span sampling rules.
    pub fn span_sampling_rules(mut self, json: &str) -> Self {
        self.span_sampling_rules = Some(json.to_string());
        self
    }

    pub fn stats_computation(mut self, enabled: bool) -> Self {
        self.stats_computation = Some(enabled);
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = Some(enabled);
        self
    }

    pub fn global_tag(mut self, key: &str, value: &str) -> Self {
        self.global_tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn service_mapping(mut self, from: &str, to: &str) -> Self {
        self.service_mappings
            .insert(from.to_string(), to.to_string());
        self
    }

    /// `header:tag` pair applied by the HTTP extraction helpers.
    pub fn header_tag(mut self, header: &str, tag: &str) -> Self {
        self.header_tags
            .push((header.to_ascii_lowercase(), tag.to_string()));
        self
    }

    pub fn propagation_style_extract(mut self, styles: &[&str]) -> Self {
        self.propagation_styles_extract =
            Some(styles.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn propagation_style_inject(mut self, styles: &[&str]) -> Self {
        self.propagation_styles_inject = Some(styles.iter().map(|s| s.to_string()).collect());
        self
    }

    /// Enables the abandoned-span debugger with the given timeout.
    pub fn span_timeout(mut self, timeout: Duration) -> Self {
        self.span_timeout = Some(timeout);
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    pub fn send_retries(mut self, retries: u32) -> Self {
        self.send_retries = Some(retries);
        self
    }

    pub fn git_commit_sha(mut self, sha: &str) -> Self {
        self.git_commit_sha = Some(sha.to_string());
        self
    }

    fn resolve_styles(input: Option<Vec<String>>, default: &[PropagationStyle]) -> Vec<PropagationStyle> {
        let Some(names) = input else {
            return default.to_vec();
        };
        let mut styles = Vec::with_capacity(names.len());
        for name in names {
            match PropagationStyle::from_name(&name) {
                Some(PropagationStyle::None) => return Vec::new(),
                Some(style) => {
                    if !styles.contains(&style) {
                        styles.push(style);
                    }
                }
                None => warn!(style = %name, "Skipping unknown propagation style"),
            }
        }
        styles
    }

    pub fn build(self) -> Config {
        let agent_url = self
            .agent_url
            .as_deref()
            .unwrap_or(DEFAULT_AGENT_URL);
        let agent_url = match parse_uri(agent_url) {
            Ok(url) => url,
            Err(error) => {
                warn!(%error, url = agent_url, "Invalid agent url, using default");
                #[allow(clippy::unwrap_used)]
                let fallback = parse_uri(DEFAULT_AGENT_URL).unwrap();
                fallback
            }
        };

        let sample_rate = self.sample_rate.and_then(|rate| {
            if (0.0..=1.0).contains(&rate) {
                Some(rate)
            } else {
                warn!(rate, "Ignoring out-of-range sample rate");
                None
            }
        });

        let trace_sampling_rules = self
            .trace_sampling_rules
            .map(|json| parse_rules_json(&json, RuleKind::Trace))
            .unwrap_or_default();
        let span_sampling_rules = self
            .span_sampling_rules
            .map(|json| parse_rules_json(&json, RuleKind::Span))
            .unwrap_or_default();

        let default_styles = [PropagationStyle::Datadog, PropagationStyle::TraceContext];

        Config {
            service: self.service.unwrap_or_else(|| "unnamed-rust-service".to_string()),
            env: self.env.unwrap_or_default(),
            version: self.version.unwrap_or_default(),
            hostname: self.hostname.unwrap_or_default(),
            agent_url,
            sample_rate,
            rate_limit: self.rate_limit.unwrap_or(ddtrace_sampling::trace_sampler::DEFAULT_RATE_LIMIT),
            trace_sampling_rules,
            span_sampling_rules,
            stats_computation: self.stats_computation.unwrap_or(true),
            debug_mode: self.debug_mode.unwrap_or(false),
            global_tags: self.global_tags,
            service_mappings: self.service_mappings,
            header_tags: self.header_tags,
            propagation_styles_extract: Self::resolve_styles(
                self.propagation_styles_extract,
                &default_styles,
            ),
            propagation_styles_inject: Self::resolve_styles(
                self.propagation_styles_inject,
                &default_styles,
            ),
            span_timeout: self.span_timeout,
            flush_interval: self.flush_interval.unwrap_or(Duration::from_secs(2)),
            send_retries: self.send_retries.unwrap_or(3),
            git_commit_sha: self.git_commit_sha.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::builder().build();
        assert_eq!(config.service, "unnamed-rust-service");
        assert_eq!(config.agent_url.to_string(), "http://localhost:8126/");
        assert_eq!(config.rate_limit, 100.0);
        assert!(config.stats_computation);
        assert_eq!(config.flush_interval, Duration::from_secs(2));
        assert_eq!(config.send_retries, 3);
        assert_eq!(
            config.propagation_styles_extract,
            vec![PropagationStyle::Datadog, PropagationStyle::TraceContext]
        );
    }

    #[test]
    fn invalid_agent_url_falls_back() {
        let config = Config::builder().agent_url("not a url at all ::").build();
        assert_eq!(config.agent_url.to_string(), "http://localhost:8126/");
    }

    #[test]
    fn bare_host_port_is_accepted() {
        let config = Config::builder().agent_url("agent:8126").build();
        assert_eq!(config.agent_url.to_string(), "http://agent:8126/");
    }

    #[test]
    fn out_of_range_sample_rate_is_dropped() {
        let config = Config::builder().sample_rate(7.0).build();
        assert_eq!(config.sample_rate, None);
        let config = Config::builder().sample_rate(0.3).build();
        assert_eq!(config.sample_rate, Some(0.3));
    }

    #[test]
    fn unknown_propagation_style_is_skipped() {
        let config = Config::builder()
            .propagation_style_extract(&["datadog", "jaeger", "b3multi"])
            .build();
        assert_eq!(
            config.propagation_styles_extract,
            vec![PropagationStyle::Datadog, PropagationStyle::B3Multi]
        );
    }

    #[test]
    fn style_none_disables_propagation() {
        let config = Config::builder()
            .propagation_style_inject(&["datadog", "none"])
            .build();
        assert!(config.propagation_styles_inject.is_empty());
    }

    #[test]
    fn invalid_rules_json_leaves_no_rules() {
        let config = Config::builder().sampling_rules("{oops").build();
        assert!(config.trace_sampling_rules.is_empty());
    }
}
