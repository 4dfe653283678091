// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod payload;
pub mod span_concentrator;
pub mod stats_exporter;

pub use span_concentrator::SpanConcentrator;
pub use stats_exporter::{LibraryMetadata, StatsExporter};

/// Span kinds eligible for stats when the agent does not override them.
pub const DEFAULT_STATS_ELIGIBLE_SPAN_KINDS: [&str; 4] =
    ["client", "server", "producer", "consumer"];

/// Path of the agent's stats intake.
pub const STATS_ENDPOINT: &str = "/v0.6/stats";
