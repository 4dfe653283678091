// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-trace bookkeeping shared by all spans of one local trace.

use crate::context::{TraceId, TRACE_ID_UPPER_TAG};
use ddtrace_common::MutexExt;
use ddtrace_sampling::priority::SamplingDecision;
use ddtrace_trace_utils::span::trace_utils::SAMPLING_PRIORITY_KEY;
use ddtrace_trace_utils::span::{Span as WireSpan, TraceChunk};
use std::collections::HashMap;
use std::sync::Mutex;

/// Hard ceiling on the spans a single trace may hold in memory. When it is
/// hit the buffered spans are pushed early and the trace latches `full`;
/// later spans are dropped and counted.
pub(crate) const MAX_SPANS_PER_TRACE: usize = 100_000;

const ORIGIN_KEY: &str = "_dd.origin";
/// Keep-rate of the ingest pipeline, stamped on every shipped chunk root.
const KEEP_RATE_KEY: &str = "_dd.tracer_kr";

pub(crate) struct Trace {
    pub(crate) trace_id: TraceId,
    inner: Mutex<TraceInner>,
}

struct TraceInner {
    open_spans: u32,
    total_spans: usize,
    finished: Vec<WireSpan>,
    decision: Option<SamplingDecision>,
    /// Priority as it will be serialized; manual overrides may rewrite it
    /// after the engine decided.
    priority: Option<i32>,
    origin: String,
    propagating_tags: HashMap<String, String>,
    full: bool,
}

/// What the accumulator wants done after a span event.
pub(crate) enum TraceUpdate {
    /// Nothing to ship yet.
    Pending,
    /// A chunk is ready for the ingest channel.
    Chunk(TraceChunk),
    /// The span was discarded (trace already full).
    DroppedSpan,
}

impl Trace {
    pub(crate) fn new(
        trace_id: TraceId,
        origin: String,
        propagating_tags: HashMap<String, String>,
        priority: Option<i32>,
    ) -> Self {
        Trace {
            trace_id,
            inner: Mutex::new(TraceInner {
                open_spans: 0,
                total_spans: 0,
                finished: Vec::new(),
                decision: None,
                priority,
                origin,
                propagating_tags,
                full: false,
            }),
        }
    }

    /// Account for a started span. Returns false when the trace is full and
    /// the span must be dropped on finish.
    pub(crate) fn register_start(&self) -> bool {
        let mut inner = self.inner.lock_or_panic();
        if inner.full {
            return false;
        }
        inner.open_spans += 1;
        inner.total_spans += 1;
        true
    }

    /// Record a finished span. A chunk comes back when the trace completed
    /// (open count returned to zero) or just latched full.
    pub(crate) fn record_finish(&self, span: WireSpan, counted: bool, keep_rate: f64) -> TraceUpdate {
        let mut inner = self.inner.lock_or_panic();
        if !counted || inner.full {
            return TraceUpdate::DroppedSpan;
        }
        inner.finished.push(span);
        inner.open_spans = inner.open_spans.saturating_sub(1);

        if inner.finished.len() >= MAX_SPANS_PER_TRACE {
            // Push what we have and orphan the rest of the trace.
            inner.full = true;
            return TraceUpdate::Chunk(Self::build_chunk(&mut inner, self.trace_id, keep_rate));
        }
        if inner.open_spans == 0 {
            return TraceUpdate::Chunk(Self::build_chunk(&mut inner, self.trace_id, keep_rate));
        }
        TraceUpdate::Pending
    }

    /// The engine's decision, memoized on the root span.
    pub(crate) fn set_decision(&self, decision: SamplingDecision) {
        let mut inner = self.inner.lock_or_panic();
        if inner.decision.is_none() {
            inner.decision = Some(decision);
        }
        if inner.priority.is_none() {
            inner.priority = Some(decision.priority);
        }
    }

    /// Manual overrides may rewrite the priority at any point before the
    /// chunk is built.
    pub(crate) fn force_priority(&self, priority: i32) {
        self.inner.lock_or_panic().priority = Some(priority);
    }

    pub(crate) fn priority(&self) -> Option<i32> {
        self.inner.lock_or_panic().priority
    }

    pub(crate) fn decision(&self) -> Option<SamplingDecision> {
        self.inner.lock_or_panic().decision
    }

    pub(crate) fn origin(&self) -> String {
        self.inner.lock_or_panic().origin.clone()
    }

    pub(crate) fn propagating_tags(&self) -> HashMap<String, String> {
        self.inner.lock_or_panic().propagating_tags.clone()
    }

    pub(crate) fn set_propagating_tag(&self, key: &str, value: &str) {
        self.inner
            .lock_or_panic()
            .propagating_tags
            .insert(key.to_string(), value.to_string());
    }

    /// Chunk-level state is carried on the first span of the chunk: the
    /// serialized priority, the origin, the keep rate and the trace-level
    /// tags, including the upper trace-id half for 128-bit ids.
    fn build_chunk(inner: &mut TraceInner, trace_id: TraceId, keep_rate: f64) -> TraceChunk {
        let mut chunk = std::mem::take(&mut inner.finished);
        if let Some(first) = chunk.first_mut() {
            let priority = inner.priority.unwrap_or(0);
            first
                .metrics
                .insert(SAMPLING_PRIORITY_KEY.to_string(), priority as f64);
            first.metrics.insert(KEEP_RATE_KEY.to_string(), keep_rate);
            if !inner.origin.is_empty() {
                first
                    .meta
                    .insert(ORIGIN_KEY.to_string(), inner.origin.clone());
            }
            for (key, value) in &inner.propagating_tags {
                first.meta.insert(key.clone(), value.clone());
            }
            if trace_id.upper != 0 {
                first
                    .meta
                    .insert(TRACE_ID_UPPER_TAG.to_string(), trace_id.upper_hex());
            }
        }
        chunk
    }
}
