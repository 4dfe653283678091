// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chunk-level span helpers: top-level marking and the client-side p0 drop
//! policy applied once stats have been computed.

use super::{Span, TraceChunk};
use std::collections::HashMap;

pub const TOP_LEVEL_KEY: &str = "_dd.top_level";
pub const MEASURED_KEY: &str = "_dd.measured";
pub const SAMPLING_PRIORITY_KEY: &str = "_sampling_priority_v1";
pub const SPAN_SAMPLING_MECHANISM_KEY: &str = "_dd.span_sampling.mechanism";

/// Mark the top-level spans of a chunk with `_dd.top_level: 1`.
///
/// A span is top-level when it is the chunk root (no parent, or a parent
/// outside the chunk) or when its service differs from its parent's, i.e. it
/// is the entry point of another service in the same trace.
pub fn compute_top_level(chunk: &mut [Span]) {
    let services_by_id: HashMap<u64, String> = chunk
        .iter()
        .map(|span| (span.span_id, span.service.clone()))
        .collect();

    for span in chunk.iter_mut() {
        let top_level = match services_by_id.get(&span.parent_id) {
            None => true,
            Some(parent_service) => *parent_service != span.service,
        };
        if top_level {
            span.metrics.insert(TOP_LEVEL_KEY.to_string(), 1.0);
        }
    }
}

pub fn has_top_level(span: &Span) -> bool {
    span.metrics.get(TOP_LEVEL_KEY).copied() == Some(1.0)
}

pub fn is_measured(span: &Span) -> bool {
    span.metrics.get(MEASURED_KEY).copied() == Some(1.0)
}

/// Sampling priority of a chunk, carried on its first span.
pub fn chunk_priority(chunk: &[Span]) -> i32 {
    chunk
        .first()
        .and_then(|span| span.metrics.get(SAMPLING_PRIORITY_KEY))
        .copied()
        .unwrap_or(0.0) as i32
}

fn span_was_single_span_sampled(span: &Span) -> bool {
    span.metrics.contains_key(SPAN_SAMPLING_MECHANISM_KEY)
}

#[derive(Debug, Default, PartialEq)]
pub struct DroppedP0Stats {
    pub dropped_p0_traces: usize,
    pub dropped_p0_spans: usize,
}

/// Drop chunks the agent would sample out anyway. Chunks with a keep
/// priority survive whole; dropped chunks are reduced to their
/// single-span-sampled spans, or removed entirely when they have none.
///
/// Only call this after the chunks were fed to the stats concentrator, and
/// only when the agent advertised that it accepts p0 drops.
pub fn drop_chunks(traces: &mut Vec<TraceChunk>) -> DroppedP0Stats {
    let mut stats = DroppedP0Stats::default();

    traces.retain_mut(|chunk| {
        if chunk_priority(chunk) > 0 {
            return true;
        }
        let before = chunk.len();
        chunk.retain(span_was_single_span_sampled);
        stats.dropped_p0_spans += before - chunk.len();
        if chunk.is_empty() {
            stats.dropped_p0_traces += 1;
            false
        } else {
            true
        }
    });

    stats
}
