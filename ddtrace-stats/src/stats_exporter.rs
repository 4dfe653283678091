// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic shipment of concentrated stats to the agent.

use crate::payload::ClientStatsPayload;
use crate::span_concentrator::SpanConcentrator;
use ddtrace_common::client::{new_default_client, read_body, Body, HttpClient};
use ddtrace_common::{header, Endpoint, MutexExt};
use hyper::Method;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Metadata required in every stats envelope.
#[derive(Debug, Default, Clone)]
pub struct LibraryMetadata {
    pub hostname: String,
    pub env: String,
    pub version: String,
    pub lang: String,
    pub tracer_version: String,
    pub runtime_id: String,
    pub service: String,
    pub container_id: String,
    pub git_commit_sha: String,
    pub tags: Vec<String>,
}

/// Sends the concentrator's buckets to the agent on the bucket cadence.
///
/// The exporter owns the flush schedule; the tracer worker owns the writes.
/// On shutdown the cancellation token fires and one final forced flush
/// drains closed and open buckets.
pub struct StatsExporter {
    concentrator: Arc<Mutex<SpanConcentrator>>,
    meta: LibraryMetadata,
    endpoint: Endpoint,
    client: HttpClient,
    sequence_id: AtomicU64,
    cancellation_token: CancellationToken,
    /// Env applied when the configured env is empty, learned from the
    /// agent's default.
    env_fallback: Mutex<Option<String>>,
}

impl StatsExporter {
    pub fn new(
        concentrator: Arc<Mutex<SpanConcentrator>>,
        meta: LibraryMetadata,
        endpoint: Endpoint,
        cancellation_token: CancellationToken,
    ) -> Self {
        StatsExporter {
            concentrator,
            meta,
            endpoint,
            client: new_default_client(),
            sequence_id: AtomicU64::new(0),
            cancellation_token,
            env_fallback: Mutex::new(None),
        }
    }

    pub fn set_env_fallback(&self, env: String) {
        *self.env_fallback.lock_or_panic() = Some(env);
    }

    /// Run until cancelled, flushing closed buckets every bucket interval.
    pub async fn run(&self) {
        let bucket_size = self.concentrator.lock_or_panic().bucket_size();
        let mut interval = tokio::time::interval(bucket_size);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.send(false).await {
                        warn!(%error, "Failed to send stats payload");
                    }
                }
                _ = self.cancellation_token.cancelled() => {
                    if let Err(error) = self.send(true).await {
                        warn!(%error, "Failed to send final stats payload");
                    }
                    return;
                }
            }
        }
    }

    /// Flush eligible buckets and POST them. A payload with no buckets is
    /// not sent.
    pub async fn send(&self, force: bool) -> anyhow::Result<()> {
        let payload = self.flush(force);
        if payload.stats.is_empty() {
            return Ok(());
        }
        let body = rmp_serde::encode::to_vec_named(&payload)?;
        debug!(
            buckets = payload.stats.len(),
            sequence = payload.sequence,
            "Sending stats payload"
        );

        let req = self
            .endpoint
            .to_request_builder(concat!("Tracer/", env!("CARGO_PKG_VERSION")))?
            .method(Method::POST)
            .header(hyper::header::CONTENT_TYPE, header::APPLICATION_MSGPACK)
            .body(Body::from(bytes::Bytes::from(body)))?;

        let response = tokio::time::timeout(
            std::time::Duration::from_millis(self.endpoint.timeout_ms),
            self.client.request(req),
        )
        .await
        .map_err(|_| anyhow::anyhow!("stats request timed out"))??;

        if !response.status().is_success() {
            let status = response.status();
            let body = read_body(response).await.unwrap_or_default();
            anyhow::bail!(
                "received {} from the stats endpoint: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            );
        }
        Ok(())
    }

    fn flush(&self, force: bool) -> ClientStatsPayload {
        let sequence = self.sequence_id.fetch_add(1, Ordering::Relaxed);
        let stats = self
            .concentrator
            .lock_or_panic()
            .flush(SystemTime::now(), force);
        let env = if self.meta.env.is_empty() {
            self.env_fallback
                .lock_or_panic()
                .clone()
                .unwrap_or_default()
        } else {
            self.meta.env.clone()
        };
        ClientStatsPayload {
            hostname: self.meta.hostname.clone(),
            env,
            version: self.meta.version.clone(),
            stats,
            lang: self.meta.lang.clone(),
            tracer_version: self.meta.tracer_version.clone(),
            runtime_id: self.meta.runtime_id.clone(),
            sequence,
            agent_aggregation: String::new(),
            service: self.meta.service.clone(),
            container_id: self.meta.container_id.clone(),
            tags: self.meta.tags.clone(),
            git_commit_sha: self.meta.git_commit_sha.clone(),
        }
    }
}
