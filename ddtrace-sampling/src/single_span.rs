// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-span sampling: rules evaluated against every finished span,
//! independently of the trace decision. A matched span carries the span
//! sampling metrics and survives shipment even when its trace is dropped.

use crate::rate_sampler::sampled_by_rate;
use crate::rules::RuleSet;
use ddtrace_trace_utils::span::Span;

pub const SPAN_SAMPLING_MECHANISM: &str = "_dd.span_sampling.mechanism";
pub const SPAN_SAMPLING_RULE_RATE: &str = "_dd.span_sampling.rule_rate";
pub const SPAN_SAMPLING_MAX_PER_SECOND: &str = "_dd.span_sampling.max_per_second";

/// Mechanism value identifying the single-span sampler.
const SINGLE_SPAN_MECHANISM: f64 = 8.0;

/// Run the span rules of `rules` against a finished span. On a keep, the
/// span sampling metrics are written onto the span and true is returned.
///
/// The rate decision hashes the span id (not the trace id) so that spans of
/// one trace are sampled independently, and each rule applies its own
/// max-per-second limiter.
pub fn sample_span(rules: &RuleSet, span: &mut Span) -> bool {
    for rule in rules.span_rules() {
        if !rule.matches(span) {
            continue;
        }
        if !sampled_by_rate(span.span_id, rule.rate) {
            return false;
        }
        let (allowed, _) = rule.allow_one();
        if !allowed {
            return false;
        }
        span.metrics
            .insert(SPAN_SAMPLING_MECHANISM.to_string(), SINGLE_SPAN_MECHANISM);
        span.metrics
            .insert(SPAN_SAMPLING_RULE_RATE.to_string(), rule.rate);
        if let Some(max_per_second) = rule.max_per_second {
            span.metrics
                .insert(SPAN_SAMPLING_MAX_PER_SECOND.to_string(), max_per_second);
        }
        return true;
    }
    false
}
