// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The live span handle handed to instrumented code.

use crate::context::SpanContext;
use crate::trace::{Trace, TraceUpdate};
use crate::worker::Pipeline;
use ddtrace_common::{time, MutexExt};
use ddtrace_sampling::priority::priorities;
use ddtrace_sampling::single_span::sample_span;
use ddtrace_trace_utils::span::Span as WireSpan;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

pub(crate) const ERROR_MSG_KEY: &str = "error.message";
pub(crate) const ERROR_TYPE_KEY: &str = "error.type";
pub(crate) const ERROR_STACK_KEY: &str = "error.stack";

const MANUAL_KEEP_KEY: &str = "manual.keep";
const MANUAL_DROP_KEY: &str = "manual.drop";
const MEASURED_KEY: &str = "_dd.measured";

/// A tag value. Strings and booleans land in `meta`, numbers in `metrics`;
/// setting a key in one map removes it from the other.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for TagValue {
    fn from(value: &str) -> Self {
        TagValue::Str(value.to_string())
    }
}

impl From<String> for TagValue {
    fn from(value: String) -> Self {
        TagValue::Str(value)
    }
}

impl From<i64> for TagValue {
    fn from(value: i64) -> Self {
        TagValue::Int(value)
    }
}

impl From<i32> for TagValue {
    fn from(value: i32) -> Self {
        TagValue::Int(value as i64)
    }
}

impl From<u64> for TagValue {
    fn from(value: u64) -> Self {
        TagValue::Int(value as i64)
    }
}

impl From<f64> for TagValue {
    fn from(value: f64) -> Self {
        TagValue::Float(value)
    }
}

impl From<bool> for TagValue {
    fn from(value: bool) -> Self {
        TagValue::Bool(value)
    }
}

impl<T: Into<TagValue>> From<Option<T>> for TagValue {
    /// `None` clears the key from both maps.
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => value.into(),
            None => TagValue::Str(String::new()),
        }
    }
}

/// Options for [`crate::Tracer::start_span`].
#[derive(Debug, Default)]
pub struct StartSpanOptions {
    /// Parent context; absent means a new root span.
    pub child_of: Option<SpanContext>,
    /// Explicit start time in unix nanoseconds.
    pub start_time_nanos: Option<i64>,
    /// Span-id override, for integrations that pre-allocate ids.
    pub span_id: Option<u64>,
    pub service: Option<String>,
    pub resource: Option<String>,
    pub span_type: Option<String>,
    pub tags: Vec<(String, TagValue)>,
    /// Force this span into client-side stats.
    pub measured: bool,
}

/// Options for [`Span::finish_with`].
#[derive(Debug, Default)]
pub struct FinishOptions {
    /// Explicit finish time in unix nanoseconds.
    pub finish_time_nanos: Option<i64>,
    pub error: bool,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    /// Skip the backtrace capture on error.
    pub no_debug_stack: bool,
    /// Cap on captured stack frames.
    pub stack_frames: Option<usize>,
}

struct SpanState {
    wire: WireSpan,
    baggage: HashMap<String, String>,
    finished: bool,
}

struct SpanInner {
    pipeline: Arc<Pipeline>,
    trace: Arc<Trace>,
    /// Immutable copy of the span id, so the context stays valid after the
    /// wire state is handed off on finish.
    span_id: u64,
    /// False when the trace was already full at start; the span is then a
    /// ghost: usable, but never recorded.
    counted: bool,
    state: Mutex<SpanState>,
}

/// A handle to one in-flight operation. Clones share the same span. A span
/// is mutable until [`Span::finish`]; afterwards every mutator is a no-op.
#[derive(Clone)]
pub struct Span {
    inner: Option<Arc<SpanInner>>,
}

impl Span {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        trace: Arc<Trace>,
        wire: WireSpan,
        baggage: HashMap<String, String>,
        counted: bool,
    ) -> Self {
        Span {
            inner: Some(Arc::new(SpanInner {
                pipeline,
                trace,
                span_id: wire.span_id,
                counted,
                state: Mutex::new(SpanState {
                    wire,
                    baggage,
                    finished: false,
                }),
            })),
        }
    }

    /// The span returned when tracing is disabled. Every operation on it is
    /// a no-op.
    pub(crate) fn noop() -> Self {
        Span { inner: None }
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn span_id(&self) -> u64 {
        self.inner.as_ref().map(|inner| inner.span_id).unwrap_or(0)
    }

    /// The propagatable state of this span.
    pub fn context(&self) -> SpanContext {
        let Some(inner) = &self.inner else {
            return SpanContext::default();
        };
        let state = inner.state.lock_or_panic();
        SpanContext {
            trace_id: inner.trace.trace_id,
            span_id: inner.span_id,
            sampling_priority: inner.trace.priority(),
            origin: inner.trace.origin(),
            baggage: state.baggage.clone(),
            propagating_tags: inner.trace.propagating_tags(),
            trace: Some(inner.trace.clone()),
        }
    }

    /// Set a tag. String and boolean values go to `meta`, numeric values to
    /// `metrics`; the `manual.keep` / `manual.drop` keys force the trace
    /// priority and `error` toggles the error flag.
    pub fn set_tag(&self, key: &str, value: impl Into<TagValue>) {
        let Some(inner) = &self.inner else { return };
        let value = value.into();

        match key {
            MANUAL_KEEP_KEY => {
                inner.trace.force_priority(priorities::USER_KEEP);
                return;
            }
            MANUAL_DROP_KEY => {
                inner.trace.force_priority(priorities::USER_REJECT);
                return;
            }
            _ => {}
        }

        let mut state = inner.state.lock_or_panic();
        if state.finished {
            return;
        }
        match key {
            "error" => {
                apply_error_tag(&mut state.wire, value);
                return;
            }
            "service.name" => {
                if let TagValue::Str(service) = value {
                    state.wire.service = service;
                }
                return;
            }
            "resource.name" => {
                if let TagValue::Str(resource) = value {
                    state.wire.resource = resource;
                }
                return;
            }
            "span.type" => {
                if let TagValue::Str(span_type) = value {
                    state.wire.r#type = span_type;
                }
                return;
            }
            _ => {}
        }

        match value {
            TagValue::Str(text) => {
                state.wire.metrics.remove(key);
                if text.is_empty() {
                    // Nil-like values clear the tag entirely.
                    state.wire.meta.remove(key);
                } else {
                    state.wire.meta.insert(key.to_string(), text);
                }
            }
            TagValue::Bool(flag) => {
                state.wire.metrics.remove(key);
                state.wire.meta.insert(key.to_string(), flag.to_string());
            }
            TagValue::Int(number) => {
                state.wire.meta.remove(key);
                state.wire.metrics.insert(key.to_string(), number as f64);
            }
            TagValue::Float(number) => {
                state.wire.meta.remove(key);
                state.wire.metrics.insert(key.to_string(), number);
            }
        }
    }

    pub fn set_baggage_item(&self, key: &str, value: &str) {
        let Some(inner) = &self.inner else { return };
        let mut state = inner.state.lock_or_panic();
        if !state.finished {
            state.baggage.insert(key.to_string(), value.to_string());
        }
    }

    /// Finish the span now.
    pub fn finish(&self) {
        self.finish_with(FinishOptions::default());
    }

    /// Finish the span. Idempotent; the first call wins. Never fails and
    /// never blocks: when the ingest channel is full the finished chunk is
    /// dropped and counted.
    pub fn finish_with(&self, options: FinishOptions) {
        let Some(inner) = &self.inner else { return };

        let wire = {
            let mut state = inner.state.lock_or_panic();
            if state.finished {
                return;
            }
            state.finished = true;

            let finish_time = options.finish_time_nanos.unwrap_or_else(time::now_nanos);
            state.wire.duration = (finish_time - state.wire.start).max(0);

            if options.error || options.error_message.is_some() {
                state.wire.error = 1;
                if let Some(message) = options.error_message {
                    state.wire.meta.insert(ERROR_MSG_KEY.to_string(), message);
                }
                if let Some(kind) = options.error_type {
                    state.wire.meta.insert(ERROR_TYPE_KEY.to_string(), kind);
                }
                if !options.no_debug_stack {
                    state.wire.meta.insert(
                        ERROR_STACK_KEY.to_string(),
                        capture_stack(options.stack_frames.unwrap_or(32)),
                    );
                }
            }

            std::mem::take(&mut state.wire)
        };

        let pipeline = &inner.pipeline;
        pipeline
            .counters
            .spans_finished
            .fetch_add(1, Ordering::Relaxed);
        if let Some(abandoned) = &pipeline.abandoned {
            abandoned.forget(wire.span_id);
        }

        let mut wire = wire;
        let rules = pipeline.sampler.rules();
        if !rules.span_rules().is_empty() {
            sample_span(&rules, &mut wire);
        }

        match inner
            .trace
            .record_finish(wire, inner.counted, pipeline.counters.keep_rate())
        {
            TraceUpdate::Pending => {}
            TraceUpdate::Chunk(chunk) => pipeline.enqueue(chunk),
            TraceUpdate::DroppedSpan => {
                pipeline.counters.spans_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run the sampling engine against this span as the trace root and
    /// memoize the outcome. The participating rates land in the root span's
    /// metrics.
    pub(crate) fn apply_root_decision(
        &self,
        sampler: &ddtrace_sampling::trace_sampler::TraceSampler,
    ) {
        use ddtrace_sampling::{AGENT_RATE_KEY, LIMIT_RATE_KEY, RULE_RATE_KEY};
        let Some(inner) = &self.inner else { return };
        let mut state = inner.state.lock_or_panic();
        let decision = sampler.decide(&state.wire, inner.trace.trace_id.lower);
        if let Some(rate) = decision.rule_rate {
            state.wire.metrics.insert(RULE_RATE_KEY.to_string(), rate);
        }
        if let Some(rate) = decision.limiter_rate {
            state.wire.metrics.insert(LIMIT_RATE_KEY.to_string(), rate);
        }
        if let Some(rate) = decision.agent_rate {
            state.wire.metrics.insert(AGENT_RATE_KEY.to_string(), rate);
        }
        inner.trace.set_decision(decision);
    }

    /// Read access to the wire state, for bookkeeping that needs a snapshot
    /// of the current tags.
    pub(crate) fn with_state<R>(&self, read: impl FnOnce(&WireSpan) -> R) -> Option<R> {
        self.inner
            .as_ref()
            .map(|inner| read(&inner.state.lock_or_panic().wire))
    }

    #[cfg(test)]
    pub(crate) fn wire_snapshot(&self) -> WireSpan {
        self.inner
            .as_ref()
            .map(|inner| inner.state.lock_or_panic().wire.clone())
            .unwrap_or_default()
    }
}

pub(crate) fn measured_metric() -> (String, f64) {
    (MEASURED_KEY.to_string(), 1.0)
}

fn apply_error_tag(wire: &mut WireSpan, value: TagValue) {
    match value {
        TagValue::Bool(false) => {
            wire.error = 0;
            wire.meta.remove(ERROR_MSG_KEY);
            wire.meta.remove(ERROR_TYPE_KEY);
            wire.meta.remove(ERROR_STACK_KEY);
        }
        TagValue::Bool(true) => wire.error = 1,
        TagValue::Int(number) => wire.error = i32::from(number != 0),
        TagValue::Float(number) => wire.error = i32::from(number != 0.0),
        TagValue::Str(message) => {
            wire.error = 1;
            if !message.is_empty() {
                wire.meta.insert(ERROR_MSG_KEY.to_string(), message);
            }
        }
    }
}

fn capture_stack(max_frames: usize) -> String {
    let backtrace = std::backtrace::Backtrace::force_capture();
    let rendered = backtrace.to_string();
    let mut out = String::new();
    for (index, line) in rendered.lines().enumerate() {
        if index >= max_frames {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}
