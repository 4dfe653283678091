// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A Datadog APM tracing client.
//!
//! Instrumented code starts spans through a [`Tracer`]; finished traces are
//! sampled, batched into msgpack payloads and shipped to a local trace
//! agent, while client-side statistics are aggregated and sent on their own
//! cadence.
//!
//! ```no_run
//! use ddtrace::{Config, StartSpanOptions, Tracer};
//!
//! let tracer = Tracer::start(
//!     Config::builder()
//!         .service("web")
//!         .env("prod")
//!         .agent_url("http://localhost:8126")
//!         .build(),
//! );
//! let span = tracer.start_span("http.request", StartSpanOptions::default());
//! span.set_tag("http.status_code", 200);
//! span.finish();
//! tracer.stop();
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod abandoned;
mod agent;
pub mod config;
mod context;
mod flusher;
pub mod propagation;
mod remote_config;
mod span;
mod telemetry;
mod trace;
mod tracer;
mod worker;

pub use config::{Config, ConfigBuilder};
pub use context::{SpanContext, TraceId};
pub use propagation::{
    ExtractError, InjectError, PropagationStyle, TextMapExtractor, TextMapInjector,
};
pub use span::{FinishOptions, Span, StartSpanOptions, TagValue};
pub use tracer::{Tracer, TracerStats};

pub use ddtrace_remote_config::ApplyState;
