// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation of finished spans into time-bucketed hit/error/duration
//! statistics.

use crate::payload::{trilean, ClientGroupedStats, ClientStatsBucket};
use datadog_ddsketch::DDSketch;
use ddtrace_trace_utils::span::trace_utils::{has_top_level, is_measured};
use ddtrace_trace_utils::span::Span;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

const TAG_STATUS_CODE: &str = "http.status_code";
const TAG_SYNTHETICS_PREFIX: &str = "synthetics";
const TAG_ORIGIN: &str = "_dd.origin";
const TAG_SPAN_KIND: &str = "span.kind";

fn align_ts(ts: u64, bucket_size: u64) -> u64 {
    ts - (ts % bucket_size)
}

fn system_time_nanos(t: SystemTime) -> u64 {
    t.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// The dimensional tuple stats are grouped over within a bucket. The
/// envelope dimensions (env, hostname, language, versions) live on the
/// payload, not here.
#[derive(Debug, Hash, PartialEq, Eq, Clone)]
struct AggregationKey {
    service: String,
    name: String,
    resource: String,
    span_type: String,
    span_kind: String,
    http_status_code: u32,
    synthetics: bool,
    is_trace_root: bool,
    peer_tags: Vec<String>,
}

impl AggregationKey {
    fn from_span(span: &Span, peer_tag_keys: &[String], obfuscate: bool) -> Self {
        let span_kind = span
            .meta
            .get(TAG_SPAN_KIND)
            .cloned()
            .unwrap_or_default();
        // Peer tags only make sense on outbound spans.
        let peer_tags = if span_kind.eq_ignore_ascii_case("client")
            || span_kind.eq_ignore_ascii_case("producer")
        {
            peer_tag_keys
                .iter()
                .filter_map(|key| span.meta.get(key).map(|value| format!("{key}:{value}")))
                .collect()
        } else {
            Vec::new()
        };
        let resource = if obfuscate {
            ddtrace_obfuscation::obfuscate_resource(&span.r#type, &span.resource)
        } else {
            span.resource.clone()
        };
        AggregationKey {
            service: span.service.clone(),
            name: span.name.clone(),
            resource,
            span_type: span.r#type.clone(),
            span_kind,
            http_status_code: span
                .meta
                .get(TAG_STATUS_CODE)
                .and_then(|code| code.parse().ok())
                .unwrap_or(0),
            synthetics: span
                .meta
                .get(TAG_ORIGIN)
                .is_some_and(|origin| origin.starts_with(TAG_SYNTHETICS_PREFIX)),
            is_trace_root: span.parent_id == 0,
            peer_tags,
        }
    }
}

/// The stats stored for each aggregation key.
#[derive(Debug, Default)]
struct GroupedStats {
    hits: u64,
    errors: u64,
    duration: u64,
    top_level_hits: u64,
    ok_summary: DDSketch,
    error_summary: DDSketch,
}

impl GroupedStats {
    fn insert(&mut self, span: &Span) {
        let duration = span.duration.max(0) as u64;
        self.hits += 1;
        self.duration += duration;
        if span.error != 0 {
            self.errors += 1;
            let _ = self.error_summary.add(duration as f64);
        } else {
            let _ = self.ok_summary.add(duration as f64);
        }
        if has_top_level(span) {
            self.top_level_hits += 1;
        }
    }

    fn export(self, key: AggregationKey) -> ClientGroupedStats {
        ClientGroupedStats {
            service: key.service,
            name: key.name,
            resource: key.resource,
            http_status_code: key.http_status_code,
            r#type: key.span_type,
            db_type: String::new(),
            hits: self.hits,
            errors: self.errors,
            duration: self.duration,
            ok_summary: self.ok_summary.encode_to_vec(),
            error_summary: self.error_summary.encode_to_vec(),
            synthetics: key.synthetics,
            top_level_hits: self.top_level_hits,
            span_kind: key.span_kind,
            peer_tags: key.peer_tags,
            is_trace_root: if key.is_trace_root {
                trilean::TRUE
            } else {
                trilean::FALSE
            },
        }
    }
}

#[derive(Debug, Default)]
struct StatsBucket {
    data: HashMap<AggregationKey, GroupedStats>,
}

/// Aggregates finished spans into buckets aligned to the bucket size.
///
/// One writer (the tracer worker) adds spans; the stats exporter flushes
/// closed buckets on its own cadence. The concentrator itself is not
/// synchronized, callers wrap it in a mutex.
#[derive(Debug)]
pub struct SpanConcentrator {
    bucket_size: u64,
    buckets: HashMap<u64, StatsBucket>,
    /// Floor for bucket starts; spans older than this land in the oldest
    /// bucket still open so flushed windows are never recreated.
    oldest_timestamp: u64,
    span_kinds: Vec<String>,
    peer_tag_keys: Vec<String>,
    obfuscation_enabled: bool,
}

impl SpanConcentrator {
    pub fn new(
        bucket_size: Duration,
        now: SystemTime,
        span_kinds: Vec<String>,
        peer_tag_keys: Vec<String>,
    ) -> Self {
        let bucket_size = bucket_size.as_nanos() as u64;
        SpanConcentrator {
            bucket_size,
            buckets: HashMap::new(),
            oldest_timestamp: align_ts(system_time_nanos(now), bucket_size),
            span_kinds,
            peer_tag_keys,
            obfuscation_enabled: false,
        }
    }

    pub fn bucket_size(&self) -> Duration {
        Duration::from_nanos(self.bucket_size)
    }

    pub fn set_span_kinds(&mut self, span_kinds: Vec<String>) {
        self.span_kinds = span_kinds;
    }

    pub fn set_peer_tags(&mut self, peer_tag_keys: Vec<String>) {
        self.peer_tag_keys = peer_tag_keys;
    }

    /// Enable resource obfuscation before key formation. Turned on when the
    /// agent advertises a compatible obfuscation version.
    pub fn set_obfuscation_enabled(&mut self, enabled: bool) {
        self.obfuscation_enabled = enabled;
    }

    fn span_kind_eligible(&self, span: &Span) -> bool {
        let kind = span.meta.get(TAG_SPAN_KIND).map(String::as_str).unwrap_or("");
        if kind.eq_ignore_ascii_case("internal") {
            return false;
        }
        if self.span_kinds.is_empty() {
            return true;
        }
        self.span_kinds
            .iter()
            .any(|eligible| eligible.eq_ignore_ascii_case(kind))
    }

    fn is_eligible(&self, span: &Span) -> bool {
        // A measured span is always counted; otherwise the span must be an
        // entry point (trace root or top-level) with an eligible kind.
        if is_measured(span) {
            return true;
        }
        (span.parent_id == 0 || has_top_level(span)) && self.span_kind_eligible(span)
    }

    /// Add a finished span to the bucket its end time aligns into.
    pub fn add_span(&mut self, span: &Span) {
        if !self.is_eligible(span) {
            return;
        }
        let end = (span.start + span.duration).max(0) as u64;
        let start = align_ts(end, self.bucket_size).max(self.oldest_timestamp);
        let key = AggregationKey::from_span(span, &self.peer_tag_keys, self.obfuscation_enabled);
        self.buckets
            .entry(start)
            .or_default()
            .data
            .entry(key)
            .or_default()
            .insert(span);
    }

    /// Drain closed buckets, i.e. buckets strictly older than the previous
    /// bucket boundary. With `force` every bucket is drained, including the
    /// one still open.
    pub fn flush(&mut self, now: SystemTime, force: bool) -> Vec<ClientStatsBucket> {
        let now_ns = system_time_nanos(now);
        let cutoff = align_ts(now_ns, self.bucket_size).saturating_sub(self.bucket_size);
        let flushed_keys: Vec<u64> = self
            .buckets
            .keys()
            .copied()
            .filter(|start| force || *start < cutoff)
            .collect();

        if !force {
            self.oldest_timestamp = self.oldest_timestamp.max(cutoff);
        }

        let bucket_size = self.bucket_size;
        flushed_keys
            .into_iter()
            .filter_map(|start| self.buckets.remove(&start).map(|bucket| (start, bucket)))
            .map(|(start, bucket)| ClientStatsBucket {
                start,
                duration: bucket_size,
                stats: bucket
                    .data
                    .into_iter()
                    .map(|(key, stats)| stats.export(key))
                    .collect(),
                agent_time_shift: 0,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUCKET: Duration = Duration::from_secs(10);

    fn concentrator(now: SystemTime) -> SpanConcentrator {
        SpanConcentrator::new(BUCKET, now, vec![], vec![])
    }

    fn top_level_span(now: SystemTime) -> Span {
        Span {
            service: "web".to_string(),
            name: "http.request".to_string(),
            resource: "GET /users".to_string(),
            span_id: 1,
            parent_id: 0,
            start: system_time_nanos(now) as i64,
            duration: 1_000_000,
            metrics: HashMap::from([("_dd.top_level".to_string(), 1.0)]),
            ..Default::default()
        }
    }

    fn flush_all(concentrator: &mut SpanConcentrator, now: SystemTime) -> Vec<ClientStatsBucket> {
        concentrator.flush(now, true)
    }

    #[test]
    fn bucket_start_is_aligned() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let span = top_level_span(now);
        concentrator.add_span(&span);
        let buckets = flush_all(&mut concentrator, now + Duration::from_secs(60));
        assert_eq!(buckets.len(), 1);
        let end = (span.start + span.duration) as u64;
        assert_eq!(buckets[0].start, align_ts(end, BUCKET.as_nanos() as u64));
        assert_eq!(buckets[0].duration, BUCKET.as_nanos() as u64);
    }

    #[test]
    fn hits_and_errors_accumulate_per_key() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let mut ok = top_level_span(now);
        ok.duration = 100;
        let mut err = top_level_span(now);
        err.error = 1;
        err.duration = 200;
        concentrator.add_span(&ok);
        concentrator.add_span(&ok);
        concentrator.add_span(&err);

        let buckets = flush_all(&mut concentrator, now + Duration::from_secs(60));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].stats.len(), 1);
        let group = &buckets[0].stats[0];
        assert_eq!(group.hits, 3);
        assert_eq!(group.errors, 1);
        assert_eq!(group.top_level_hits, 3);
        assert_eq!(group.duration, 400);
        assert!(!group.ok_summary.is_empty());
        assert!(!group.error_summary.is_empty());
        assert_eq!(group.is_trace_root, trilean::TRUE);
    }

    #[test]
    fn different_resources_get_different_keys() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let mut a = top_level_span(now);
        a.resource = "GET /a".to_string();
        let mut b = top_level_span(now);
        b.resource = "GET /b".to_string();
        concentrator.add_span(&a);
        concentrator.add_span(&b);
        let buckets = flush_all(&mut concentrator, now + Duration::from_secs(60));
        assert_eq!(buckets[0].stats.len(), 2);
    }

    #[test]
    fn non_top_level_span_is_skipped() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let mut child = top_level_span(now);
        child.parent_id = 42;
        child.metrics.clear();
        concentrator.add_span(&child);
        assert!(concentrator.is_empty());
    }

    #[test]
    fn measured_span_is_counted_even_when_nested() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let mut child = top_level_span(now);
        child.parent_id = 42;
        child.metrics = HashMap::from([("_dd.measured".to_string(), 1.0)]);
        concentrator.add_span(&child);
        assert!(!concentrator.is_empty());
    }

    #[test]
    fn internal_kind_is_excluded() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let mut span = top_level_span(now);
        span.meta
            .insert("span.kind".to_string(), "internal".to_string());
        concentrator.add_span(&span);
        assert!(concentrator.is_empty());
    }

    #[test]
    fn kind_allow_list_filters_entry_spans() {
        let now = SystemTime::now();
        let mut concentrator = SpanConcentrator::new(
            BUCKET,
            now - Duration::from_secs(60),
            vec!["server".to_string()],
            vec![],
        );
        let mut server = top_level_span(now);
        server
            .meta
            .insert("span.kind".to_string(), "server".to_string());
        let mut unknown = top_level_span(now);
        unknown
            .meta
            .insert("span.kind".to_string(), "cache".to_string());
        concentrator.add_span(&server);
        concentrator.add_span(&unknown);
        let buckets = flush_all(&mut concentrator, now + Duration::from_secs(60));
        assert_eq!(buckets[0].stats.len(), 1);
        assert_eq!(buckets[0].stats[0].span_kind, "server");
    }

    #[test]
    fn http_status_and_synthetics_come_from_meta() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let mut span = top_level_span(now);
        span.meta
            .insert("http.status_code".to_string(), "503".to_string());
        span.meta
            .insert("_dd.origin".to_string(), "synthetics-browser".to_string());
        concentrator.add_span(&span);
        let buckets = flush_all(&mut concentrator, now + Duration::from_secs(60));
        let group = &buckets[0].stats[0];
        assert_eq!(group.http_status_code, 503);
        assert!(group.synthetics);
    }

    #[test]
    fn peer_tags_collected_for_client_spans() {
        let now = SystemTime::now();
        let mut concentrator = SpanConcentrator::new(
            BUCKET,
            now - Duration::from_secs(60),
            vec![],
            vec!["db.hostname".to_string()],
        );
        let mut span = top_level_span(now);
        span.meta
            .insert("span.kind".to_string(), "client".to_string());
        span.meta
            .insert("db.hostname".to_string(), "pg-1".to_string());
        concentrator.add_span(&span);
        let buckets = flush_all(&mut concentrator, now + Duration::from_secs(60));
        assert_eq!(buckets[0].stats[0].peer_tags, vec!["db.hostname:pg-1"]);
    }

    #[test]
    fn only_closed_buckets_flush_without_force() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        let mut old = top_level_span(now - Duration::from_secs(40));
        old.start = system_time_nanos(now - Duration::from_secs(40)) as i64;
        let fresh = top_level_span(now);
        concentrator.add_span(&old);
        concentrator.add_span(&fresh);

        let flushed = concentrator.flush(now, false);
        assert_eq!(flushed.len(), 1);
        assert!(!concentrator.is_empty());

        let rest = concentrator.flush(now, true);
        assert_eq!(rest.len(), 1);
        assert!(concentrator.is_empty());
    }

    #[test]
    fn late_span_lands_in_oldest_open_bucket() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now);
        // Flush to move the floor forward.
        let _ = concentrator.flush(now + Duration::from_secs(30), false);
        let floor = concentrator.oldest_timestamp;

        let mut stale = top_level_span(now - Duration::from_secs(3600));
        stale.start = system_time_nanos(now - Duration::from_secs(3600)) as i64;
        concentrator.add_span(&stale);
        assert!(concentrator.buckets.keys().all(|start| *start >= floor));
    }

    #[test]
    fn obfuscation_rewrites_sql_resources() {
        let now = SystemTime::now();
        let mut concentrator = concentrator(now - Duration::from_secs(60));
        concentrator.set_obfuscation_enabled(true);
        let mut span = top_level_span(now);
        span.r#type = "sql".to_string();
        span.resource = "SELECT * FROM users WHERE id = 42".to_string();
        concentrator.add_span(&span);
        let buckets = flush_all(&mut concentrator, now + Duration::from_secs(60));
        assert_eq!(
            buckets[0].stats[0].resource,
            "SELECT * FROM users WHERE id = ?"
        );
    }
}
