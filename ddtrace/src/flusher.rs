// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload rotation and shipment to the trace agent.
//!
//! The flusher owns the accumulating payload. Flushes rotate it out and
//! send it in a background task; at most one send is in flight, one more
//! payload may wait behind it, and anything beyond that drops the oldest
//! pending payload rather than stalling the worker.

use crate::config::{Config, LANGUAGE, TRACER_VERSION};
use bytes::Bytes;
use ddtrace_common::client::{new_default_client, read_body, HttpClient};
use ddtrace_common::{entity_id, header, Endpoint, MutexExt};
use ddtrace_sampling::trace_sampler::TraceSampler;
use ddtrace_trace_utils::payload::{Payload, PayloadError};
use ddtrace_trace_utils::send_with_retry::{
    send_with_retry, RetryBackoffType, RetryStrategy, SendWithRetryError,
};
use ddtrace_trace_utils::span::trace_utils::DroppedP0Stats;
use ddtrace_trace_utils::span::TraceChunk;
use ddtrace_trace_utils::tracer_header_tags::TracerHeaderTags;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::worker::PipelineCounters;

pub(crate) const TRACE_ENDPOINT: &str = "/v0.4/traces";

struct FlushJob {
    body: Bytes,
    chunks: u32,
}

pub(crate) struct TraceFlusher {
    /// Self-reference handed to the background send tasks.
    me: std::sync::Weak<TraceFlusher>,
    endpoint: Endpoint,
    client: HttpClient,
    payload: Mutex<Payload>,
    pending: Mutex<Option<FlushJob>>,
    /// One permit: at most one send in flight per tracer.
    send_slot: Arc<Semaphore>,
    retry_strategy: RetryStrategy,
    sampler: Arc<TraceSampler>,
    counters: Arc<PipelineCounters>,
    /// Whether stats computation is active, reflected in the request
    /// headers so the agent skips its own computation.
    stats_enabled: bool,
    dropped_p0_traces: AtomicUsize,
    dropped_p0_spans: AtomicUsize,
    /// Payloads dropped because a send was in flight and the pending slot
    /// was already taken.
    pub(crate) backpressure_drops: AtomicU64,
}

impl TraceFlusher {
    pub fn new(
        config: &Config,
        sampler: Arc<TraceSampler>,
        counters: Arc<PipelineCounters>,
    ) -> anyhow::Result<Arc<Self>> {
        let endpoint = Endpoint::from_url(config.agent_url.clone()).join_path(TRACE_ENDPOINT)?;
        Ok(Arc::new_cyclic(|me| TraceFlusher {
            me: me.clone(),
            endpoint,
            client: new_default_client(),
            payload: Mutex::new(Payload::new()),
            pending: Mutex::new(None),
            send_slot: Arc::new(Semaphore::new(1)),
            retry_strategy: RetryStrategy::new(
                config.send_retries.max(1),
                100,
                RetryBackoffType::Exponential,
                Some(100),
            ),
            sampler,
            counters,
            stats_enabled: config.stats_computation,
            dropped_p0_traces: AtomicUsize::new(0),
            dropped_p0_spans: AtomicUsize::new(0),
            backpressure_drops: AtomicU64::new(0),
        }))
    }

    pub fn record_dropped_p0s(&self, dropped: &DroppedP0Stats) {
        self.dropped_p0_traces
            .fetch_add(dropped.dropped_p0_traces, Ordering::Relaxed);
        self.dropped_p0_spans
            .fetch_add(dropped.dropped_p0_spans, Ordering::Relaxed);
    }

    /// Append a chunk to the accumulating payload. A full payload triggers
    /// a flush and one retry; a chunk that still does not fit is dropped.
    pub fn push_chunk(&self, chunk: TraceChunk) {
        let stats = {
            let mut payload = self.payload.lock_or_panic();
            match payload.push(&chunk) {
                Ok(stats) => Some(stats),
                Err(PayloadError::Full { .. }) => None,
                Err(PayloadError::Encoding(message)) => {
                    self.counters.encoding_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %message, "Dropping unencodable trace chunk");
                    return;
                }
            }
        };

        match stats {
            Some(stats) => {
                if stats.over_soft_limit() {
                    self.schedule_flush();
                }
            }
            None => {
                self.schedule_flush();
                let retried = self.payload.lock_or_panic().push(&chunk);
                if retried.is_err() {
                    self.counters.traces_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Dropping trace chunk larger than the payload limit");
                }
            }
        }
    }

    fn rotate(&self) -> Option<FlushJob> {
        let mut payload = self.payload.lock_or_panic();
        if payload.is_empty() {
            return None;
        }
        let full = std::mem::replace(&mut *payload, Payload::new());
        let chunks = full.stats().item_count;
        Some(FlushJob {
            body: Bytes::from(full.into_body()),
            chunks,
        })
    }

    /// Rotate and ship in the background. Called from the worker; never
    /// waits on the network.
    pub fn schedule_flush(&self) {
        let Some(job) = self.rotate() else { return };
        match self.send_slot.clone().try_acquire_owned() {
            Ok(permit) => {
                let Some(flusher) = self.me.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    let mut job = job;
                    loop {
                        flusher.send_job(job).await;
                        match flusher.pending.lock_or_panic().take() {
                            Some(next) => job = next,
                            None => break,
                        }
                    }
                    drop(permit);
                });
            }
            Err(_) => {
                let mut pending = self.pending.lock_or_panic();
                if pending.is_some() {
                    // Two payloads are already queued behind the send;
                    // sacrifice the oldest.
                    self.backpressure_drops.fetch_add(1, Ordering::Relaxed);
                    self.counters.payloads_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("Backpressure: dropping oldest pending payload");
                }
                *pending = Some(job);
            }
        }
    }

    /// Rotate and ship inline, waiting for any in-flight send first. Used
    /// by `flush()` and shutdown.
    pub async fn flush_and_wait(&self) {
        let job = self.rotate();
        let _permit = match self.send_slot.acquire().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        loop {
            // Take outside the await so the lock is never held across it.
            let pending = self.pending.lock_or_panic().take();
            match pending {
                Some(pending) => self.send_job(pending).await,
                None => break,
            }
        }
        if let Some(job) = job {
            self.send_job(job).await;
        }
    }

    fn request_headers(&self, chunks: u32) -> HashMap<&'static str, String> {
        let tags = TracerHeaderTags {
            lang: LANGUAGE,
            lang_version: "",
            lang_interpreter: "rustc",
            lang_vendor: "rust-lang",
            tracer_version: TRACER_VERSION,
            container_id: entity_id::get_container_id().unwrap_or(""),
            client_computed_top_level: true,
            client_computed_stats: self.stats_enabled,
            dropped_p0_traces: self.dropped_p0_traces.swap(0, Ordering::Relaxed),
            dropped_p0_spans: self.dropped_p0_spans.swap(0, Ordering::Relaxed),
        };
        let mut headers: HashMap<&'static str, String> = tags.into();
        headers.insert("content-type", header::APPLICATION_MSGPACK_STR.to_string());
        headers.insert(header::DATADOG_TRACE_COUNT_STR, chunks.to_string());
        headers
    }

    async fn send_job(&self, job: FlushJob) {
        let headers = self.request_headers(job.chunks);
        let result = send_with_retry(
            &self.client,
            &self.endpoint,
            job.body,
            &headers,
            &self.retry_strategy,
        )
        .await;

        match result {
            Ok((response, attempts)) => {
                debug!(chunks = job.chunks, attempts, "Trace payload sent");
                match read_body(response).await {
                    Ok(body) => {
                        // The response carries the per-service rates for the
                        // priority sampler; a malformed body keeps the
                        // previous table.
                        if let Err(error) = self.sampler.priority_sampler().update_rates(&body) {
                            debug!(%error, "Ignoring malformed rate_by_service response");
                        }
                    }
                    Err(error) => debug!(%error, "Failed to read agent response body"),
                }
            }
            Err(SendWithRetryError::Http(response, attempts)) => {
                self.account_failed_send(job.chunks);
                let status = response.status();
                let body = read_body(response).await.unwrap_or_default();
                warn!(
                    status = status.as_u16(),
                    attempts,
                    error = %String::from_utf8_lossy(&body),
                    "Trace payload rejected by the agent"
                );
            }
            Err(error) => {
                self.account_failed_send(job.chunks);
                warn!(%error, attempts = error.attempts(), "Failed to send trace payload");
            }
        }
    }

    fn account_failed_send(&self, chunks: u32) {
        self.counters.payloads_dropped.fetch_add(1, Ordering::Relaxed);
        self.counters
            .traces_dropped
            .fetch_add(chunks as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use ddtrace_sampling::rules::RuleSet;
    use ddtrace_trace_utils::span::Span as WireSpan;
    use httpmock::MockServer;

    fn flusher_for(server: &MockServer, retries: u32) -> Arc<TraceFlusher> {
        let config = Config::builder()
            .service("web")
            .agent_url(&server.url(""))
            .send_retries(retries)
            .build();
        let sampler = Arc::new(TraceSampler::new(
            RuleSet::new(vec![], vec![]),
            -1.0,
            "test",
        ));
        TraceFlusher::new(&config, sampler, Arc::new(PipelineCounters::default())).unwrap()
    }

    fn chunk(name: &str) -> TraceChunk {
        vec![WireSpan {
            name: name.to_string(),
            trace_id: 1,
            span_id: 1,
            ..Default::default()
        }]
    }

    #[tokio::test]
    async fn sends_payload_with_agent_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/v0.4/traces")
                    .header("content-type", "application/msgpack")
                    .header("x-datadog-trace-count", "1")
                    .header("datadog-meta-lang", "rust");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(r#"{"rate_by_service":{"service:,env:":0.7}}"#);
            })
            .await;

        let flusher = flusher_for(&server, 1);
        flusher.push_chunk(chunk("a"));
        flusher.flush_and_wait().await;
        mock.assert_async().await;

        // The response updated the priority sampler table.
        assert_eq!(flusher.sampler.priority_sampler().rate_for("any", "any"), 0.7);
    }

    #[tokio::test]
    async fn empty_payload_is_not_sent() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/v0.4/traces");
                then.status(200);
            })
            .await;
        let flusher = flusher_for(&server, 1);
        flusher.flush_and_wait().await;
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn failed_send_counts_dropped_traces() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/v0.4/traces");
                then.status(500).body("busy");
            })
            .await;

        let flusher = flusher_for(&server, 1);
        flusher.push_chunk(chunk("a"));
        flusher.push_chunk(chunk("b"));
        flusher.flush_and_wait().await;

        assert_eq!(flusher.counters.payloads_dropped.load(Ordering::Relaxed), 1);
        assert_eq!(flusher.counters.traces_dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn new_payload_starts_empty_after_flush() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/v0.4/traces");
                then.status(200);
            })
            .await;

        let flusher = flusher_for(&server, 1);
        flusher.push_chunk(chunk("a"));
        flusher.flush_and_wait().await;
        assert!(flusher.payload.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backpressure_drops_oldest_pending_payload() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST).path("/v0.4/traces");
                then.status(200).delay(std::time::Duration::from_millis(500));
            })
            .await;

        let flusher = flusher_for(&server, 1);

        // First flush occupies the single send slot for ~500ms.
        flusher.push_chunk(chunk("in-flight"));
        flusher.schedule_flush();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Two more flushes while the send slot is taken: the second evicts
        // the first from the pending slot.
        flusher.push_chunk(chunk("pending-1"));
        flusher.schedule_flush();
        flusher.push_chunk(chunk("pending-2"));
        flusher.schedule_flush();

        assert_eq!(flusher.backpressure_drops.load(Ordering::Relaxed), 1);
        assert_eq!(flusher.counters.payloads_dropped.load(Ordering::Relaxed), 1);

        flusher.flush_and_wait().await;
    }

    #[tokio::test]
    async fn dropped_p0_headers_reset_after_send() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::POST)
                    .path("/v0.4/traces")
                    .header("datadog-client-dropped-p0-traces", "3")
                    .header("datadog-client-dropped-p0-spans", "9");
                then.status(200);
            })
            .await;

        let flusher = flusher_for(&server, 1);
        flusher.record_dropped_p0s(&DroppedP0Stats {
            dropped_p0_traces: 3,
            dropped_p0_spans: 9,
        });
        flusher.push_chunk(chunk("a"));
        flusher.flush_and_wait().await;
        mock.assert_async().await;

        // Counts were consumed by the send.
        let headers = flusher.request_headers(1);
        assert!(!headers.contains_key("datadog-client-dropped-p0-traces"));
    }
}
