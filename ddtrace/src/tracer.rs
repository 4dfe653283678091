// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tracer facade: span factory, background workers and lifecycle.

use crate::abandoned::{AbandonedRegistry, OpenSpanEntry};
use crate::agent::AgentInfoFetcher;
use crate::config::{Config, LANGUAGE, TRACER_VERSION};
use crate::context::{SpanContext, TraceId};
use crate::flusher::TraceFlusher;
use crate::propagation::{
    header_tags_from, ExtractError, InjectError, Propagator, TextMapExtractor, TextMapInjector,
};
use crate::span::{measured_metric, Span, StartSpanOptions};
use crate::trace::Trace;
use crate::worker::{
    run_worker, Pipeline, PipelineCounters, WorkerContext, INGEST_CHANNEL_CAPACITY,
};
use arc_swap::ArcSwap;
use ddtrace_common::{id, time, MutexExt};
use ddtrace_common::Endpoint;
use ddtrace_sampling::rules::{RuleKind, RuleSet, SamplingRule};
use ddtrace_sampling::trace_sampler::TraceSampler;
use ddtrace_stats::{
    LibraryMetadata, SpanConcentrator, StatsExporter, DEFAULT_STATS_ELIGIBLE_SPAN_KINDS,
    STATS_ENDPOINT,
};
use ddtrace_trace_utils::span::Span as WireSpan;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Bucket width of client-side stats.
const STATS_BUCKET_SIZE: Duration = Duration::from_secs(10);
/// How long `stop` waits for background tasks to drain.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Settings that remote configuration may swap at runtime.
pub(crate) struct DynamicState {
    pub header_tags: Vec<(String, String)>,
    pub global_tags: HashMap<String, String>,
}

/// The locally configured rules, kept around so remote updates can layer on
/// top of them and reverts can restore them.
pub(crate) struct LocalRules {
    pub trace: Vec<SamplingRule>,
    pub span: Vec<SamplingRule>,
}

pub(crate) struct TracerInner {
    pub config: Arc<Config>,
    pub pipeline: Arc<Pipeline>,
    pub sampler: Arc<TraceSampler>,
    /// Snapshot of the locally configured rules, restored when remote
    /// configuration reverts.
    pub local_rules: Arc<RuleSet>,
    /// The explicit local rules, without the catch-all rate rule.
    pub local_explicit: Arc<LocalRules>,
    pub dynamic: ArcSwap<DynamicState>,
    pub base_dynamic: Arc<DynamicState>,
    propagator: Propagator,
    pub enabled: AtomicBool,
    /// Latched once the remote kill switch fired; re-enables are ignored.
    pub kill_switch_latched: AtomicBool,
    shutdown: CancellationToken,
    runtime: Mutex<Option<Runtime>>,
    runtime_handle: Option<tokio::runtime::Handle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    flush_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    stopped: AtomicBool,
}

/// Snapshot of the pipeline counters, for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerStats {
    pub spans_started: u64,
    pub spans_finished: u64,
    pub spans_dropped: u64,
    pub chunks_received: u64,
    pub chunks_kept: u64,
    pub traces_dropped: u64,
    pub payloads_dropped: u64,
    pub p0_traces_dropped: u64,
    pub p0_spans_dropped: u64,
    pub baggage_items_dropped: u64,
}

/// The tracing client. Cheap to clone; all clones share one pipeline.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

/// Match-any rule carrying a global sample rate, evaluated after the
/// explicit rules.
pub(crate) fn catch_all_rule(rate: f64) -> Option<SamplingRule> {
    match SamplingRule::new(
        "",
        "",
        "",
        HashMap::new(),
        rate,
        None,
        RuleKind::Trace,
        ddtrace_sampling::rules::Provenance::Local,
    ) {
        Ok(rule) => Some(rule),
        Err(error) => {
            warn!(%error, "Failed to build catch-all sampling rule");
            None
        }
    }
}

fn build_local_rules(config: &mut Config) -> (Arc<RuleSet>, Arc<LocalRules>) {
    let explicit = Arc::new(LocalRules {
        trace: std::mem::take(&mut config.trace_sampling_rules),
        span: std::mem::take(&mut config.span_sampling_rules),
    });
    let mut trace_rules = explicit.trace.clone();
    if let Some(rule) = config.sample_rate.and_then(catch_all_rule) {
        trace_rules.push(rule);
    }
    (
        RuleSet::new(trace_rules, explicit.span.clone()),
        explicit,
    )
}

impl Tracer {
    /// Build and start a tracer. Never fails: when the background runtime
    /// cannot be created the returned tracer is disabled and every span is
    /// a no-op.
    pub fn start(mut config: Config) -> Tracer {
        let (local_rules, local_explicit) = build_local_rules(&mut config);
        let config = Arc::new(config);
        let counters = Arc::new(PipelineCounters::default());
        let sampler = Arc::new(TraceSampler::new(
            local_rules.clone(),
            config.rate_limit,
            &config.env,
        ));

        let base_dynamic = Arc::new(DynamicState {
            header_tags: config.header_tags.clone(),
            global_tags: config.global_tags.clone(),
        });

        let propagator = Propagator::new(
            config.propagation_styles_inject.clone(),
            config.propagation_styles_extract.clone(),
            counters.clone(),
        );

        let (chunk_tx, chunk_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let abandoned = config
            .span_timeout
            .map(|_| Arc::new(AbandonedRegistry::default()));

        let pipeline = Arc::new(Pipeline {
            sampler: sampler.clone(),
            chunk_tx,
            counters: counters.clone(),
            abandoned: abandoned.clone(),
        });

        let flusher = match TraceFlusher::new(&config, sampler.clone(), counters.clone()) {
            Ok(flusher) => flusher,
            Err(error) => {
                error!(%error, "Failed to set up the trace flusher, tracer disabled");
                return Self::disabled(
                    config,
                    pipeline,
                    sampler,
                    local_rules,
                    local_explicit,
                    base_dynamic,
                    propagator,
                    shutdown,
                    flush_tx,
                );
            }
        };

        let runtime = match Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ddtrace-worker")
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                error!(%error, "Failed to start the tracer runtime, tracer disabled");
                return Self::disabled(
                    config,
                    pipeline,
                    sampler,
                    local_rules,
                    local_explicit,
                    base_dynamic,
                    propagator,
                    shutdown,
                    flush_tx,
                );
            }
        };

        let agent_info = match AgentInfoFetcher::new(&config.agent_url) {
            Ok(fetcher) => Arc::new(fetcher),
            Err(error) => {
                error!(%error, "Invalid agent url, tracer disabled");
                return Self::disabled(
                    config,
                    pipeline,
                    sampler,
                    local_rules,
                    local_explicit,
                    base_dynamic,
                    propagator,
                    shutdown,
                    flush_tx,
                );
            }
        };

        let mut tasks = Vec::new();

        // Stats pipeline.
        let (concentrator, stats_exporter) = if config.stats_computation {
            let concentrator = Arc::new(Mutex::new(SpanConcentrator::new(
                STATS_BUCKET_SIZE,
                SystemTime::now(),
                DEFAULT_STATS_ELIGIBLE_SPAN_KINDS.map(String::from).to_vec(),
                Vec::new(),
            )));
            let stats_endpoint = Endpoint::from_url(config.agent_url.clone())
                .join_path(STATS_ENDPOINT)
                .ok();
            match stats_endpoint {
                Some(endpoint) => {
                    let exporter = Arc::new(StatsExporter::new(
                        concentrator.clone(),
                        LibraryMetadata {
                            hostname: config.hostname.clone(),
                            env: config.env.clone(),
                            version: config.version.clone(),
                            lang: LANGUAGE.to_string(),
                            tracer_version: TRACER_VERSION.to_string(),
                            runtime_id: uuid::Uuid::new_v4().to_string(),
                            service: config.service.clone(),
                            container_id: ddtrace_common::entity_id::get_container_id()
                                .unwrap_or_default()
                                .to_string(),
                            git_commit_sha: config.git_commit_sha.clone(),
                            tags: config
                                .global_tags
                                .iter()
                                .map(|(key, value)| format!("{key}:{value}"))
                                .collect(),
                        },
                        endpoint,
                        shutdown.child_token(),
                    ));
                    let run_exporter = exporter.clone();
                    tasks.push(runtime.spawn(async move { run_exporter.run().await }));
                    (Some(concentrator), Some(exporter))
                }
                None => (Some(concentrator), None),
            }
        } else {
            (None, None)
        };

        // Agent capability discovery.
        {
            let fetcher = agent_info.clone();
            let token = shutdown.clone();
            tasks.push(runtime.spawn(async move { fetcher.run(token).await }));
        }

        // Abandoned-span debugger.
        if let (Some(registry), Some(timeout)) = (abandoned.clone(), config.span_timeout) {
            let token = shutdown.clone();
            tasks.push(runtime.spawn(async move { registry.run(timeout, token).await }));
        }

        // The chunk worker.
        {
            let worker = WorkerContext {
                pipeline: pipeline.clone(),
                chunk_rx,
                flush_rx,
                flusher: flusher.clone(),
                concentrator,
                stats_exporter,
                agent_info,
                shutdown: shutdown.clone(),
                flush_interval: config.flush_interval,
                debug_mode: config.debug_mode,
            };
            tasks.push(runtime.spawn(run_worker(worker)));
        }

        let runtime_handle = runtime.handle().clone();
        Tracer {
            inner: Arc::new(TracerInner {
                config,
                pipeline,
                sampler,
                local_rules,
                local_explicit,
                dynamic: ArcSwap::new(base_dynamic.clone()),
                base_dynamic,
                propagator,
                enabled: AtomicBool::new(true),
                kill_switch_latched: AtomicBool::new(false),
                shutdown,
                runtime: Mutex::new(Some(runtime)),
                runtime_handle: Some(runtime_handle),
                tasks: Mutex::new(tasks),
                flush_tx,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn disabled(
        config: Arc<Config>,
        pipeline: Arc<Pipeline>,
        sampler: Arc<TraceSampler>,
        local_rules: Arc<RuleSet>,
        local_explicit: Arc<LocalRules>,
        base_dynamic: Arc<DynamicState>,
        propagator: Propagator,
        shutdown: CancellationToken,
        flush_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    ) -> Tracer {
        Tracer {
            inner: Arc::new(TracerInner {
                config,
                pipeline,
                sampler,
                local_rules,
                local_explicit,
                dynamic: ArcSwap::new(base_dynamic.clone()),
                base_dynamic,
                propagator,
                enabled: AtomicBool::new(false),
                kill_switch_latched: AtomicBool::new(true),
                shutdown,
                runtime: Mutex::new(None),
                runtime_handle: None,
                tasks: Mutex::new(Vec::new()),
                flush_tx,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &TracerInner {
        &self.inner
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Relaxed);
        self.inner.kill_switch_latched.store(true, Ordering::Relaxed);
    }

    /// Start a span. Never fails and never blocks; with tracing disabled a
    /// no-op span comes back.
    pub fn start_span(&self, operation: &str, options: StartSpanOptions) -> Span {
        let inner = &self.inner;
        if !inner.enabled.load(Ordering::Relaxed) {
            return Span::noop();
        }
        inner
            .pipeline
            .counters
            .spans_started
            .fetch_add(1, Ordering::Relaxed);

        let parent = options
            .child_of
            .filter(|context| context.is_valid() || context.trace.is_some());
        let (trace, parent_id, baggage) = match parent {
            Some(context) => {
                let trace = match &context.trace {
                    Some(trace) => trace.clone(),
                    None => Arc::new(Trace::new(
                        context.trace_id,
                        context.origin.clone(),
                        context.propagating_tags.clone(),
                        context.sampling_priority,
                    )),
                };
                (trace, context.span_id, context.baggage)
            }
            None => {
                let (lower, upper) = id::rand_trace_id();
                (
                    Arc::new(Trace::new(
                        TraceId::new(lower, upper),
                        String::new(),
                        HashMap::new(),
                        None,
                    )),
                    0,
                    HashMap::new(),
                )
            }
        };

        let counted = trace.register_start();
        let span_id = options.span_id.unwrap_or_else(id::rand_span_id);
        let service = options
            .service
            .unwrap_or_else(|| inner.config.service.clone());
        let service = inner
            .config
            .service_mappings
            .get(&service)
            .cloned()
            .unwrap_or(service);

        let mut wire = WireSpan {
            service,
            name: operation.to_string(),
            resource: options
                .resource
                .unwrap_or_else(|| operation.to_string()),
            r#type: options.span_type.unwrap_or_default(),
            trace_id: trace.trace_id.as_u128(),
            span_id,
            parent_id,
            start: options.start_time_nanos.unwrap_or_else(time::now_nanos),
            ..Default::default()
        };

        let dynamic = inner.dynamic.load();
        for (key, value) in &dynamic.global_tags {
            wire.meta.insert(key.clone(), value.clone());
        }
        if !inner.config.env.is_empty() {
            wire.meta.insert("env".to_string(), inner.config.env.clone());
        }
        if !inner.config.version.is_empty() {
            wire.meta
                .insert("version".to_string(), inner.config.version.clone());
        }
        if options.measured {
            let (key, value) = measured_metric();
            wire.metrics.insert(key, value);
        }

        let span = Span::new(
            inner.pipeline.clone(),
            trace.clone(),
            wire,
            baggage,
            counted,
        );
        for (key, value) in options.tags {
            span.set_tag(&key, value);
        }

        if trace.priority().is_none() {
            span.apply_root_decision(&inner.sampler);
        }

        if let Some(abandoned) = &inner.pipeline.abandoned {
            if let Some(entry) = span.with_state(|wire| OpenSpanEntry {
                span_id: wire.span_id,
                trace_id: wire.trace_id as u64,
                name: wire.name.clone(),
                integration: wire
                    .meta
                    .get("component")
                    .cloned()
                    .unwrap_or_else(|| "manual".to_string()),
                start_nanos: wire.start,
            }) {
                abandoned.track(entry);
            }
        }

        span
    }

    /// Write a context into a carrier using the configured inject styles.
    pub fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn TextMapInjector,
    ) -> Result<(), InjectError> {
        self.inner.propagator.inject(context, carrier)
    }

    /// Resolve a context from a carrier using the configured extract styles.
    pub fn extract(&self, carrier: &dyn TextMapExtractor) -> Result<SpanContext, ExtractError> {
        self.inner.propagator.extract(carrier)
    }

    /// Tag values harvested from a carrier per the configured
    /// `header -> tag` pairs.
    pub fn header_tags(&self, carrier: &dyn TextMapExtractor) -> Vec<(String, String)> {
        header_tags_from(carrier, &self.inner.dynamic.load().header_tags)
    }

    /// Block until everything enqueued so far is shipped or errored, up to
    /// the deadline. Returns whether the flush completed in time.
    pub fn flush(&self, deadline: Duration) -> bool {
        let Some(handle) = &self.inner.runtime_handle else {
            return false;
        };
        let (tx, rx) = oneshot::channel();
        if self.inner.flush_tx.send(tx).is_err() {
            return false;
        }
        handle.block_on(async move {
            matches!(tokio::time::timeout(deadline, rx).await, Ok(Ok(())))
        })
    }

    /// Drain the pipeline and release every background task. Safe to call
    /// more than once; only the first call does the work.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.inner.tasks.lock_or_panic());
        if let Some(handle) = &self.inner.runtime_handle {
            handle.block_on(async move {
                let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
                for task in tasks {
                    let remaining = deadline
                        .saturating_duration_since(tokio::time::Instant::now());
                    if tokio::time::timeout(remaining, task).await.is_err() {
                        warn!("Tracer shutdown deadline reached with tasks still running");
                        break;
                    }
                }
            });
        }

        if let Some(runtime) = self.inner.runtime.lock_or_panic().take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> TracerStats {
        let counters = &self.inner.pipeline.counters;
        TracerStats {
            spans_started: counters.spans_started.load(Ordering::Relaxed),
            spans_finished: counters.spans_finished.load(Ordering::Relaxed),
            spans_dropped: counters.spans_dropped.load(Ordering::Relaxed),
            chunks_received: counters.chunks_received.load(Ordering::Relaxed),
            chunks_kept: counters.chunks_kept.load(Ordering::Relaxed),
            traces_dropped: counters.traces_dropped.load(Ordering::Relaxed),
            payloads_dropped: counters.payloads_dropped.load(Ordering::Relaxed),
            p0_traces_dropped: counters.p0_traces_dropped.load(Ordering::Relaxed),
            p0_spans_dropped: counters.p0_spans_dropped.load(Ordering::Relaxed),
            baggage_items_dropped: counters.baggage_items_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::TagValue;

    fn test_tracer() -> Tracer {
        Tracer::start(
            Config::builder()
                .service("web")
                .env("test")
                .agent_url("http://localhost:1") // nothing listens; sends fail fast
                .stats_computation(false)
                .build(),
        )
    }

    #[test]
    fn start_span_sets_identity_fields() {
        let tracer = test_tracer();
        let span = tracer.start_span("http.request", StartSpanOptions::default());
        let wire = span.wire_snapshot();
        assert_eq!(wire.name, "http.request");
        assert_eq!(wire.service, "web");
        assert_eq!(wire.resource, "http.request");
        assert_ne!(wire.span_id, 0);
        assert_eq!(wire.parent_id, 0);
        assert_eq!(wire.meta.get("env").map(String::as_str), Some("test"));
        tracer.stop();
    }

    #[test]
    fn child_span_inherits_trace() {
        let tracer = test_tracer();
        let parent = tracer.start_span("parent", StartSpanOptions::default());
        let parent_context = parent.context();
        let child = tracer.start_span(
            "child",
            StartSpanOptions {
                child_of: Some(parent_context.clone()),
                ..Default::default()
            },
        );
        let wire = child.wire_snapshot();
        assert_eq!(wire.trace_id as u64, parent_context.trace_id.lower);
        assert_eq!(wire.parent_id, parent_context.span_id);
        tracer.stop();
    }

    #[test]
    fn root_decision_is_memoized_on_trace() {
        let tracer = test_tracer();
        let root = tracer.start_span("root", StartSpanOptions::default());
        let priority = root.context().sampling_priority;
        assert!(priority.is_some());
        // A child of the same trace sees the same priority.
        let child = tracer.start_span(
            "child",
            StartSpanOptions {
                child_of: Some(root.context()),
                ..Default::default()
            },
        );
        assert_eq!(child.context().sampling_priority, priority);
        tracer.stop();
    }

    #[test]
    fn service_mapping_applies() {
        let tracer = Tracer::start(
            Config::builder()
                .service("web")
                .agent_url("http://localhost:1")
                .stats_computation(false)
                .service_mapping("old-db", "db")
                .build(),
        );
        let span = tracer.start_span(
            "query",
            StartSpanOptions {
                service: Some("old-db".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(span.wire_snapshot().service, "db");
        tracer.stop();
    }

    #[test]
    fn initial_tags_apply_typing_rules() {
        let tracer = test_tracer();
        let span = tracer.start_span(
            "op",
            StartSpanOptions {
                tags: vec![
                    ("http.method".to_string(), TagValue::from("GET")),
                    ("retries".to_string(), TagValue::from(3i64)),
                ],
                ..Default::default()
            },
        );
        let wire = span.wire_snapshot();
        assert_eq!(wire.meta.get("http.method").map(String::as_str), Some("GET"));
        assert_eq!(wire.metrics.get("retries"), Some(&3.0));
        tracer.stop();
    }

    #[test]
    fn stop_is_idempotent() {
        let tracer = test_tracer();
        tracer.stop();
        tracer.stop();
    }

    #[test]
    fn sampling_rate_metrics_are_recorded_on_the_root() {
        let tracer = Tracer::start(
            Config::builder()
                .service("web")
                .agent_url("http://localhost:1")
                .stats_computation(false)
                .sampling_rules(r#"[{"service":"web","sample_rate":1.0}]"#)
                .build(),
        );
        let span = tracer.start_span("op", StartSpanOptions::default());
        let wire = span.wire_snapshot();
        assert_eq!(wire.metrics.get("_dd.rule_psr"), Some(&1.0));
        assert!(wire.metrics.contains_key("_dd.limit_psr"));
        assert!(!wire.metrics.contains_key("_dd.agent_psr"));
        tracer.stop();
    }

    #[test]
    fn agent_rate_metric_recorded_without_rules() {
        let tracer = test_tracer();
        let span = tracer.start_span("op", StartSpanOptions::default());
        let wire = span.wire_snapshot();
        assert_eq!(wire.metrics.get("_dd.agent_psr"), Some(&1.0));
        assert!(!wire.metrics.contains_key("_dd.rule_psr"));
        tracer.stop();
    }

    #[test]
    fn long_open_span_shows_in_abandoned_report() {
        let timeout = Duration::from_millis(500);
        let tracer = Tracer::start(
            Config::builder()
                .service("web")
                .agent_url("http://localhost:1")
                .stats_computation(false)
                .span_timeout(timeout)
                .build(),
        );
        let ten_minutes_ago = time::now_nanos() - 600 * 1_000_000_000;
        let stuck = tracer.start_span(
            "stuck.operation",
            StartSpanOptions {
                start_time_nanos: Some(ten_minutes_ago),
                ..Default::default()
            },
        );
        let registry = tracer.inner().pipeline.abandoned.clone().unwrap();
        let report = registry.report(time::now_nanos(), timeout).unwrap();
        assert!(report.starts_with("1 abandoned spans:"));
        assert!(report.contains("name: stuck.operation"));
        assert!(report.contains("integration: manual"));
        assert!(report.contains(&format!("span_id: {}", stuck.span_id())));

        // Finishing clears the registry.
        stuck.finish();
        assert!(registry.report(time::now_nanos(), timeout).is_none());
        tracer.stop();
    }

    #[test]
    fn finished_root_span_reaches_the_worker() {
        let tracer = test_tracer();
        let span = tracer.start_span("op", StartSpanOptions::default());
        span.finish();
        assert!(tracer.flush(Duration::from_secs(5)));
        let stats = tracer.stats();
        assert_eq!(stats.spans_started, 1);
        assert_eq!(stats.spans_finished, 1);
        assert_eq!(stats.chunks_received, 1);
        tracer.stop();
    }
}
