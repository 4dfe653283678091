// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod priority;
pub mod priority_sampler;
pub mod rate_sampler;
pub mod rules;
pub mod single_span;
pub mod trace_sampler;

/// Metric set on root spans with the rate of the sampling rule that matched.
pub const RULE_RATE_KEY: &str = "_dd.rule_psr";
/// Metric set on root spans with the rate limiter's effective rate.
pub const LIMIT_RATE_KEY: &str = "_dd.limit_psr";
/// Metric set on root spans with the agent feedback rate that was applied.
pub const AGENT_RATE_KEY: &str = "_dd.agent_psr";
