// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The abandoned-span debugger: a periodic check logging spans that have
//! been open longer than the configured timeout. Observes only; it never
//! touches span state.

use ddtrace_common::{time, MutexExt};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Log lines are cut at this many characters.
const LOG_CHAR_BUDGET: usize = 9000;
const TRUNCATION_MARKER: &str = ", Truncating message";

#[derive(Debug, Clone)]
pub(crate) struct OpenSpanEntry {
    pub span_id: u64,
    pub trace_id: u64,
    pub name: String,
    pub integration: String,
    pub start_nanos: i64,
}

/// Registry of currently open spans, keyed by span id. Spans register on
/// start and deregister on finish.
#[derive(Debug, Default)]
pub(crate) struct AbandonedRegistry {
    spans: Mutex<HashMap<u64, OpenSpanEntry>>,
}

impl AbandonedRegistry {
    pub fn track(&self, entry: OpenSpanEntry) {
        self.spans.lock_or_panic().insert(entry.span_id, entry);
    }

    pub fn forget(&self, span_id: u64) {
        self.spans.lock_or_panic().remove(&span_id);
    }

    pub fn open_count(&self) -> usize {
        self.spans.lock_or_panic().len()
    }

    fn snapshot(&self) -> Vec<OpenSpanEntry> {
        self.spans.lock_or_panic().values().cloned().collect()
    }

    /// The report the next tick would log, if any span is overdue.
    pub fn report(&self, now_nanos: i64, timeout: Duration) -> Option<String> {
        format_report(&self.snapshot(), now_nanos, timeout)
    }

    /// Run until cancelled, reporting every `timeout / 2`. A final summary
    /// is emitted on shutdown.
    pub async fn run(&self, timeout: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(timeout / 2);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(report) = self.report(time::now_nanos(), timeout) {
                        warn!("{report}");
                    }
                }
                _ = shutdown.cancelled() => {
                    if let Some(report) = self.report(time::now_nanos(), timeout) {
                        warn!("Shutting down with abandoned spans. {report}");
                    }
                    return;
                }
            }
        }
    }
}

/// Build the report for spans older than `timeout`, bucketed by
/// timeout-sized age buckets, oldest first. `None` when nothing qualifies.
pub(crate) fn format_report(
    entries: &[OpenSpanEntry],
    now_nanos: i64,
    timeout: Duration,
) -> Option<String> {
    let timeout_nanos = timeout.as_nanos() as i64;
    if timeout_nanos == 0 {
        return None;
    }

    // Bucket index -> entries, ordered oldest bucket first.
    let mut buckets: BTreeMap<i64, Vec<&OpenSpanEntry>> = BTreeMap::new();
    let mut abandoned = 0usize;
    for entry in entries {
        let age = now_nanos - entry.start_nanos;
        if age <= timeout_nanos {
            continue;
        }
        abandoned += 1;
        buckets.entry(-(age / timeout_nanos)).or_default().push(entry);
    }
    if abandoned == 0 {
        return None;
    }

    let mut report = format!("{abandoned} abandoned spans:");
    let mut truncated = false;
    'outer: for entries in buckets.values() {
        for entry in entries {
            let age_seconds = (now_nanos - entry.start_nanos) as f64 / 1e9;
            let line = format!(
                " [name: {}, integration: {}, span_id: {}, trace_id: {}, age: {:.0}s],",
                entry.name, entry.integration, entry.span_id, entry.trace_id, age_seconds
            );
            if report.len() + line.len() + TRUNCATION_MARKER.len() > LOG_CHAR_BUDGET {
                truncated = true;
                break 'outer;
            }
            report.push_str(&line);
        }
    }
    if truncated {
        report.push_str(TRUNCATION_MARKER);
    }
    Some(report)
}
