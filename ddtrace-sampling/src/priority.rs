// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sampling priorities and the decision record attached to a trace.

/// Sampling priorities carried on the context. Negative rejects, >= 1 keeps.
pub mod priorities {
    /// Drop forced by the user (`manual.drop`, rule drop, limiter drop).
    pub const USER_REJECT: i32 = -1;
    /// Drop decided by the automatic samplers.
    pub const AUTO_REJECT: i32 = 0;
    /// Keep decided by the automatic samplers or a matching rule.
    pub const AUTO_KEEP: i32 = 1;
    /// Keep forced by the user (`manual.keep`).
    pub const USER_KEEP: i32 = 2;
}

/// How a decision was reached; reported alongside the priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMechanism {
    /// Default rate before any agent feedback.
    Default,
    /// Agent-supplied per-service rate.
    AgentRate,
    /// A locally configured trace sampling rule.
    LocalTraceRule,
    /// A `manual.keep` / `manual.drop` user override.
    Manual,
    /// A single-span sampling rule.
    SingleSpanRule,
    /// A remotely configured customer trace rule.
    RemoteCustomerTraceRule,
    /// A remotely configured dynamic trace rule.
    RemoteDynamicTraceRule,
}

impl SamplingMechanism {
    pub fn as_u32(self) -> u32 {
        match self {
            SamplingMechanism::Default => 0,
            SamplingMechanism::AgentRate => 1,
            SamplingMechanism::LocalTraceRule => 3,
            SamplingMechanism::Manual => 4,
            SamplingMechanism::SingleSpanRule => 8,
            SamplingMechanism::RemoteCustomerTraceRule => 11,
            SamplingMechanism::RemoteDynamicTraceRule => 12,
        }
    }
}

/// The outcome of running the sampling engine on a root span. The rates that
/// participated are carried along so the tracer can record them as metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingDecision {
    pub priority: i32,
    pub mechanism: SamplingMechanism,
    /// Rate of the matching trace rule, when one matched.
    pub rule_rate: Option<f64>,
    /// Effective rate of the global limiter, when it was consulted.
    pub limiter_rate: Option<f64>,
    /// Agent feedback rate, when the priority sampler decided.
    pub agent_rate: Option<f64>,
}

impl SamplingDecision {
    pub fn keep(&self) -> bool {
        self.priority > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_order() {
        assert!(priorities::USER_REJECT < priorities::AUTO_REJECT);
        assert!(priorities::AUTO_REJECT < priorities::AUTO_KEEP);
        assert!(priorities::AUTO_KEEP < priorities::USER_KEEP);
    }

    #[test]
    fn keep_threshold() {
        let mut decision = SamplingDecision {
            priority: priorities::AUTO_KEEP,
            mechanism: SamplingMechanism::AgentRate,
            rule_rate: None,
            limiter_rate: None,
            agent_rate: None,
        };
        assert!(decision.keep());
        decision.priority = priorities::AUTO_REJECT;
        assert!(!decision.keep());
        decision.priority = priorities::USER_REJECT;
        assert!(!decision.keep());
    }
}
