// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The layered trace sampling decision: configured rules first, then the
//! agent's feedback rates, with a global rate limiter capping rule keeps.

use crate::priority::{priorities, SamplingDecision, SamplingMechanism};
use crate::priority_sampler::PrioritySampler;
use crate::rate_sampler::sampled_by_rate;
use crate::rules::{Provenance, RuleSet};
use arc_swap::ArcSwap;
use ddtrace_common::rate_limiter::RateLimiter;
use ddtrace_trace_utils::span::Span;
use std::sync::Arc;

/// Trace-rule keeps are capped at this many traces per second unless
/// configured otherwise.
pub const DEFAULT_RATE_LIMIT: f64 = 100.0;

pub struct TraceSampler {
    rules: ArcSwap<RuleSet>,
    limiter: RateLimiter,
    priority_sampler: PrioritySampler,
    env: String,
}

impl TraceSampler {
    pub fn new(rules: Arc<RuleSet>, rate_limit: f64, env: &str) -> Self {
        TraceSampler {
            rules: ArcSwap::new(rules),
            limiter: RateLimiter::new(rate_limit),
            priority_sampler: PrioritySampler::new(),
            env: env.to_string(),
        }
    }

    /// Swap in a new rule snapshot. Readers pick it up on their next
    /// decision; in-flight decisions finish against the old snapshot.
    pub fn swap_rules(&self, rules: Arc<RuleSet>) {
        self.rules.store(rules);
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.load_full()
    }

    pub fn priority_sampler(&self) -> &PrioritySampler {
        &self.priority_sampler
    }

    /// Decide the priority for a trace, once, on its root span.
    ///
    /// `trace_id_lower` is the lower 64 bits of the trace id; the decision
    /// is deterministic in it for a fixed rule set and rate table.
    pub fn decide(&self, root: &Span, trace_id_lower: u64) -> SamplingDecision {
        let rules = self.rules.load();
        if let Some(rule) = rules.match_trace_rule(root) {
            let mechanism = match rule.provenance {
                Provenance::Customer => SamplingMechanism::RemoteCustomerTraceRule,
                Provenance::Dynamic => SamplingMechanism::RemoteDynamicTraceRule,
                Provenance::Local => SamplingMechanism::LocalTraceRule,
            };
            if !sampled_by_rate(trace_id_lower, rule.rate) {
                return SamplingDecision {
                    priority: priorities::USER_REJECT,
                    mechanism,
                    rule_rate: Some(rule.rate),
                    limiter_rate: None,
                    agent_rate: None,
                };
            }
            let limit = self.limiter.allow_one();
            let priority = if limit.allowed {
                priorities::AUTO_KEEP
            } else {
                priorities::USER_REJECT
            };
            return SamplingDecision {
                priority,
                mechanism,
                rule_rate: Some(rule.rate),
                limiter_rate: Some(limit.effective_rate),
                agent_rate: None,
            };
        }

        let agent_rate = self.priority_sampler.rate_for(&root.service, &self.env);
        let priority = if sampled_by_rate(trace_id_lower, agent_rate) {
            priorities::AUTO_KEEP
        } else {
            priorities::AUTO_REJECT
        };
        SamplingDecision {
            priority,
            mechanism: SamplingMechanism::AgentRate,
            rule_rate: None,
            limiter_rate: None,
            agent_rate: Some(agent_rate),
        }
    }
}
