// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The ingest side of the tracer: the shared pipeline handle spans push
//! into, and the single worker task that consumes finished chunks.

use crate::abandoned::AbandonedRegistry;
use crate::agent::AgentInfoFetcher;
use crate::flusher::TraceFlusher;
use ddtrace_common::MutexExt;
use ddtrace_sampling::trace_sampler::TraceSampler;
use ddtrace_stats::{SpanConcentrator, StatsExporter};
use ddtrace_trace_utils::span::trace_utils::{chunk_priority, compute_top_level};
use ddtrace_trace_utils::span::TraceChunk;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Capacity of the chunk channel between the hot path and the worker.
pub(crate) const INGEST_CHANNEL_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
pub(crate) struct PipelineCounters {
    pub spans_started: AtomicU64,
    pub spans_finished: AtomicU64,
    /// Spans discarded because their trace hit the per-trace span ceiling.
    pub spans_dropped: AtomicU64,
    pub chunks_received: AtomicU64,
    pub chunks_kept: AtomicU64,
    /// Chunks lost to a full ingest channel or a full payload.
    pub traces_dropped: AtomicU64,
    /// Whole payloads dropped by flusher backpressure or final send failure.
    pub payloads_dropped: AtomicU64,
    pub p0_traces_dropped: AtomicU64,
    pub p0_spans_dropped: AtomicU64,
    pub encoding_errors: AtomicU64,
    pub baggage_items_dropped: AtomicU64,
}

impl PipelineCounters {
    /// Ratio of kept chunks over received ones, reported as `_dd.tracer_kr`.
    pub fn keep_rate(&self) -> f64 {
        let received = self.chunks_received.load(Ordering::Relaxed);
        if received == 0 {
            return 1.0;
        }
        self.chunks_kept.load(Ordering::Relaxed) as f64 / received as f64
    }
}

/// Everything a live span needs to finish itself: the ingest channel, the
/// sampler for single-span rules and the drop counters. Shared by the
/// tracer facade and every span handle.
pub(crate) struct Pipeline {
    pub sampler: Arc<TraceSampler>,
    pub chunk_tx: mpsc::Sender<TraceChunk>,
    pub counters: Arc<PipelineCounters>,
    pub abandoned: Option<Arc<AbandonedRegistry>>,
}

impl Pipeline {
    /// Hand a finished chunk to the worker. Never blocks: a full channel
    /// drops the chunk and bumps the counter.
    pub fn enqueue(&self, chunk: TraceChunk) {
        match self.chunk_tx.try_send(chunk) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.traces_dropped.fetch_add(1, Ordering::Relaxed);
                debug!("Ingest channel full, dropping trace chunk");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.traces_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub(crate) struct WorkerContext {
    pub pipeline: Arc<Pipeline>,
    pub chunk_rx: mpsc::Receiver<TraceChunk>,
    pub flush_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
    pub flusher: Arc<TraceFlusher>,
    pub concentrator: Option<Arc<Mutex<SpanConcentrator>>>,
    pub stats_exporter: Option<Arc<StatsExporter>>,
    pub agent_info: Arc<AgentInfoFetcher>,
    pub shutdown: CancellationToken,
    pub flush_interval: Duration,
    /// Log every processed chunk.
    pub debug_mode: bool,
}

/// The single consumer of the ingest channel. Owns the flush timer; applies
/// agent feature toggles as `/info` responses arrive.
pub(crate) async fn run_worker(mut ctx: WorkerContext) {
    let mut ticker = tokio::time::interval(ctx.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Hash of the last agent info applied to the stats path.
    let mut applied_info_hash = String::new();

    loop {
        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                // Drain whatever made it into the channel before the
                // deadline, then push the final payload out.
                while let Ok(chunk) = ctx.chunk_rx.try_recv() {
                    process_chunk(&mut applied_info_hash, &ctx, chunk);
                }
                ctx.flusher.flush_and_wait().await;
                return;
            }
            Some(ack) = ctx.flush_rx.recv() => {
                while let Ok(chunk) = ctx.chunk_rx.try_recv() {
                    process_chunk(&mut applied_info_hash, &ctx, chunk);
                }
                ctx.flusher.flush_and_wait().await;
                let _ = ack.send(());
            }
            Some(chunk) = ctx.chunk_rx.recv() => {
                process_chunk(&mut applied_info_hash, &ctx, chunk);
            }
            _ = ticker.tick() => {
                ctx.flusher.schedule_flush();
            }
        }
    }
}

fn apply_agent_info(applied_hash: &mut String, ctx: &WorkerContext) {
    let Some(info) = ctx.agent_info.info() else {
        return;
    };
    if info.state_hash == *applied_hash {
        return;
    }
    applied_hash.clone_from(&info.state_hash);

    if let Some(concentrator) = &ctx.concentrator {
        let mut concentrator = concentrator.lock_or_panic();
        concentrator.set_obfuscation_enabled(
            info.info.obfuscation_version.unwrap_or(0)
                <= ddtrace_obfuscation::OBFUSCATION_VERSION
                && info.info.obfuscation_version.is_some(),
        );
        if let Some(span_kinds) = info.info.span_kinds_stats_computed.clone() {
            concentrator.set_span_kinds(span_kinds);
        }
        if let Some(peer_tags) = info.info.peer_tags.clone() {
            concentrator.set_peer_tags(peer_tags);
        }
    }
    if let Some(exporter) = &ctx.stats_exporter {
        if let Some(default_env) = ctx.agent_info.default_env() {
            exporter.set_env_fallback(default_env);
        }
    }
}

fn process_chunk(applied_info_hash: &mut String, ctx: &WorkerContext, mut chunk: TraceChunk) {
    let counters = &ctx.pipeline.counters;
    counters.chunks_received.fetch_add(1, Ordering::Relaxed);

    apply_agent_info(applied_info_hash, ctx);
    compute_top_level(&mut chunk);
    if ctx.debug_mode {
        debug!(
            trace_id = chunk.first().map(|span| span.trace_id as u64).unwrap_or(0),
            spans = chunk.len(),
            priority = chunk_priority(&chunk),
            "Processing trace chunk"
        );
    }

    // Stats stay on unless the agent's endpoint list says otherwise.
    let stats_active = ctx.concentrator.is_some() && ctx.agent_info.stats_endpoint_supported();
    if stats_active {
        if let Some(concentrator) = &ctx.concentrator {
            let mut concentrator = concentrator.lock_or_panic();
            for span in &chunk {
                concentrator.add_span(span);
            }
        }
    }

    let keep = chunk_priority(&chunk) > 0;
    if keep {
        counters.chunks_kept.fetch_add(1, Ordering::Relaxed);
    } else {
        let can_drop = stats_active && ctx.agent_info.drop_p0s_allowed();
        if can_drop {
            // Stats were computed above; only single-span-sampled spans of a
            // dropped chunk still need to travel.
            let mut traces = vec![chunk];
            let dropped = ddtrace_trace_utils::span::trace_utils::drop_chunks(&mut traces);
            counters
                .p0_traces_dropped
                .fetch_add(dropped.dropped_p0_traces as u64, Ordering::Relaxed);
            counters
                .p0_spans_dropped
                .fetch_add(dropped.dropped_p0_spans as u64, Ordering::Relaxed);
            ctx.flusher.record_dropped_p0s(&dropped);
            match traces.pop() {
                Some(partial) => chunk = partial,
                None => return,
            }
        }
    }

    ctx.flusher.push_chunk(chunk);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddtrace_sampling::rules::RuleSet;
    use ddtrace_trace_utils::span::Span as WireSpan;

    fn pipeline_with_capacity(capacity: usize) -> (Arc<Pipeline>, mpsc::Receiver<TraceChunk>) {
        let (chunk_tx, chunk_rx) = mpsc::channel(capacity);
        let sampler = Arc::new(TraceSampler::new(RuleSet::new(vec![], vec![]), -1.0, ""));
        (
            Arc::new(Pipeline {
                sampler,
                chunk_tx,
                counters: Arc::new(PipelineCounters::default()),
                abandoned: None,
            }),
            chunk_rx,
        )
    }

    fn chunk() -> TraceChunk {
        vec![WireSpan {
            span_id: 1,
            ..Default::default()
        }]
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (pipeline, _rx) = pipeline_with_capacity(2);
        pipeline.enqueue(chunk());
        pipeline.enqueue(chunk());
        // Channel is full now; these must return immediately and count.
        pipeline.enqueue(chunk());
        pipeline.enqueue(chunk());
        assert_eq!(pipeline.counters.traces_dropped.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn closed_channel_counts_drops() {
        let (pipeline, rx) = pipeline_with_capacity(1);
        drop(rx);
        pipeline.enqueue(chunk());
        assert_eq!(pipeline.counters.traces_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn keep_rate_reflects_counters() {
        let (pipeline, _rx) = pipeline_with_capacity(1);
        assert_eq!(pipeline.counters.keep_rate(), 1.0);
        pipeline.counters.chunks_received.store(4, Ordering::Relaxed);
        pipeline.counters.chunks_kept.store(1, Ordering::Relaxed);
        assert_eq!(pipeline.counters.keep_rate(), 0.25);
    }
}
