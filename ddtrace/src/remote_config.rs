// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Application of dynamic-configuration updates to a running tracer.

use crate::telemetry::{configuration_changed, ConfigurationOrigin};
use crate::tracer::{DynamicState, Tracer};
use ddtrace_remote_config::dynamic::{
    parse_json, Configs, TracingSamplingRule, TracingSamplingRuleProvenance,
};
use ddtrace_remote_config::ApplyState;
use ddtrace_sampling::rules::{Provenance, RuleKind, RuleSet, SamplingRule};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

fn build_remote_rule(rule: &TracingSamplingRule) -> Option<SamplingRule> {
    let provenance = match rule.provenance {
        TracingSamplingRuleProvenance::Customer => Provenance::Customer,
        TracingSamplingRuleProvenance::Dynamic => Provenance::Dynamic,
    };
    if !(0.0..=1.0).contains(&rule.sample_rate) {
        warn!(rate = rule.sample_rate, "Skipping remote rule with out-of-range rate");
        return None;
    }
    let tags: HashMap<String, String> = rule
        .tags
        .iter()
        .map(|tag| (tag.key.clone(), tag.value_glob.clone()))
        .collect();
    match SamplingRule::new(
        &rule.service,
        rule.name.as_deref().unwrap_or(""),
        &rule.resource,
        tags,
        rule.sample_rate,
        None,
        RuleKind::Trace,
        provenance,
    ) {
        Ok(rule) => Some(rule),
        Err(error) => {
            warn!(%error, "Skipping remote rule with invalid pattern");
            None
        }
    }
}

impl Tracer {
    /// Apply one dynamic-configuration file. The update is validated and
    /// fully constructed before anything is swapped in, so a returned error
    /// means the tracer state is untouched.
    pub fn apply_remote_config(&self, path: &str, raw: &[u8]) -> ApplyState {
        let file = match parse_json(raw) {
            Ok(file) => file,
            Err(error) => {
                return ApplyState::error(format!("invalid configuration at {path}: {error}"))
            }
        };

        let inner = self.inner();
        if file.service_target.service != inner.config.service {
            return ApplyState::error(format!(
                "service target mismatch: got {}, tracer is {}",
                file.service_target.service, inner.config.service
            ));
        }
        if file.service_target.env != inner.config.env {
            return ApplyState::error(format!(
                "env target mismatch: got {}, tracer is {}",
                file.service_target.env, inner.config.env
            ));
        }

        if file.lib_config.is_empty() {
            self.revert_remote_config();
            return ApplyState::Acknowledged;
        }

        let configs: Vec<Configs> = file.lib_config.into();
        let mut remote_rate: Option<f64> = None;
        let mut remote_rules: Option<Vec<SamplingRule>> = None;
        let mut header_tags: Option<Vec<(String, String)>> = None;
        let mut global_tags: Option<HashMap<String, String>> = None;
        let mut enabled: Option<bool> = None;

        for config in configs {
            match config {
                Configs::TracingSampleRate(rate) => {
                    if (0.0..=1.0).contains(&rate) {
                        remote_rate = Some(rate);
                    } else {
                        return ApplyState::error(format!("sampling rate out of range: {rate}"));
                    }
                }
                Configs::TracingSamplingRules(rules) => {
                    remote_rules = Some(rules.iter().filter_map(build_remote_rule).collect());
                }
                Configs::TracingHeaderTags(tags) => {
                    header_tags = Some(
                        tags.into_iter()
                            .map(|(header, tag)| (header.to_ascii_lowercase(), tag))
                            .collect(),
                    );
                }
                Configs::TracingTags(tags) => {
                    global_tags = Some(
                        tags.iter()
                            .filter_map(|tag| {
                                tag.split_once(':')
                                    .map(|(key, value)| (key.to_string(), value.to_string()))
                            })
                            .collect(),
                    );
                }
                Configs::TracingEnabled(value) => enabled = Some(value),
            }
        }

        // Everything parsed; now swap the pieces in.
        if enabled == Some(false) {
            self.disable();
            configuration_changed("tracing_enabled", "false", ConfigurationOrigin::RemoteConfig);
        } else if enabled == Some(true)
            && self.inner().kill_switch_latched.load(Ordering::Relaxed)
        {
            // The kill switch is one-way within a process lifetime.
            warn!("Ignoring remote re-enable of tracing after a disable");
        }

        if remote_rate.is_some() || remote_rules.is_some() {
            let rules = self.build_rule_set(remote_rate, remote_rules.unwrap_or_default());
            inner.sampler.swap_rules(rules);
            if let Some(rate) = remote_rate {
                configuration_changed(
                    "trace_sample_rate",
                    &rate.to_string(),
                    ConfigurationOrigin::RemoteConfig,
                );
            }
        }

        if header_tags.is_some() || global_tags.is_some() {
            let current = inner.dynamic.load_full();
            let next = DynamicState {
                header_tags: header_tags
                    .clone()
                    .unwrap_or_else(|| current.header_tags.clone()),
                global_tags: global_tags
                    .clone()
                    .unwrap_or_else(|| current.global_tags.clone()),
            };
            inner.dynamic.store(Arc::new(next));
            if header_tags.is_some() {
                configuration_changed(
                    "trace_header_tags",
                    "updated",
                    ConfigurationOrigin::RemoteConfig,
                );
            }
            if global_tags.is_some() {
                configuration_changed("tracing_tags", "updated", ConfigurationOrigin::RemoteConfig);
            }
        }

        ApplyState::Acknowledged
    }

    /// Rebuild a full rule set from remote inputs: remote rules rank first
    /// by provenance, the explicit local rules stay, and the catch-all rate
    /// is the remote one when present.
    fn build_rule_set(
        &self,
        remote_rate: Option<f64>,
        mut remote_rules: Vec<SamplingRule>,
    ) -> Arc<RuleSet> {
        let inner = self.inner();

        let mut trace_rules: Vec<SamplingRule> = Vec::new();
        trace_rules.append(&mut remote_rules);
        trace_rules.extend(inner.local_explicit.trace.iter().cloned());

        let effective_rate = remote_rate.or(inner.config.sample_rate);
        if let Some(rule) = effective_rate.and_then(crate::tracer::catch_all_rule) {
            trace_rules.push(rule);
        }

        RuleSet::new(trace_rules, inner.local_explicit.span.iter().cloned().collect())
    }

    /// Back to the most recent non-remote configuration.
    pub(crate) fn revert_remote_config(&self) {
        let inner = self.inner();
        inner.sampler.swap_rules(inner.local_rules.clone());
        inner.dynamic.store(inner.base_dynamic.clone());
        let origin = if inner.config.sample_rate.is_some() {
            ConfigurationOrigin::Code
        } else {
            ConfigurationOrigin::Default
        };
        configuration_changed(
            "trace_sample_rate",
            &inner
                .config
                .sample_rate
                .map(|rate| rate.to_string())
                .unwrap_or_else(|| "unset".to_string()),
            origin,
        );
    }
}
