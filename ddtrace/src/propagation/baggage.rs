// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Baggage: user key/values travelling as a comma-separated header of
//! URL-encoded pairs.

use crate::context::SpanContext;
use crate::propagation::TextMapInjector;
use crate::worker::PipelineCounters;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

pub(super) const BAGGAGE_HEADER: &str = "baggage";

/// At most this many pairs are injected.
const MAX_BAGGAGE_ITEMS: usize = 64;
/// The rendered header may not exceed this many bytes.
const MAX_BAGGAGE_BYTES: usize = 8192;

// Characters that survive unencoded in keys and values, per the W3C
// baggage token/value grammar.
fn is_safe_key_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_' | b'`' | b'|' | b'~')
}

fn encode_key(key: &str) -> String {
    if key.bytes().all(is_safe_key_byte) {
        key.to_string()
    } else {
        urlencoding::encode(key).into_owned()
    }
}

fn encode_value(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

pub(super) fn inject(
    context: &SpanContext,
    carrier: &mut dyn TextMapInjector,
    counters: &PipelineCounters,
) {
    if context.baggage.is_empty() {
        return;
    }
    let mut pairs: Vec<(&String, &String)> = context.baggage.iter().collect();
    pairs.sort();

    let mut header = String::new();
    let mut dropped = 0u64;
    for (index, (key, value)) in pairs.iter().enumerate() {
        if index >= MAX_BAGGAGE_ITEMS {
            dropped += (pairs.len() - index) as u64;
            break;
        }
        let pair = format!("{}={}", encode_key(key), encode_value(value));
        let extra = if header.is_empty() { pair.len() } else { pair.len() + 1 };
        if header.len() + extra > MAX_BAGGAGE_BYTES {
            dropped += (pairs.len() - index) as u64;
            break;
        }
        if !header.is_empty() {
            header.push(',');
        }
        header.push_str(&pair);
    }

    if dropped > 0 {
        counters
            .baggage_items_dropped
            .fetch_add(dropped, Ordering::Relaxed);
    }
    if !header.is_empty() {
        carrier.set(BAGGAGE_HEADER, &header);
    }
}

pub(super) fn extract(
    headers: &HashMap<String, String>,
    context: &mut SpanContext,
    counters: &PipelineCounters,
) {
    let Some(raw) = headers.get(BAGGAGE_HEADER) else {
        return;
    };
    for pair in raw.split(',') {
        let Some((key, value)) = pair.split_once('=') else {
            counters.baggage_items_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        // Properties (`;`-suffixed metadata) are not kept.
        let value = value.split(';').next().unwrap_or(value);
        let key = match urlencoding::decode(key.trim()) {
            Ok(key) if !key.is_empty() => key.into_owned(),
            _ => {
                counters.baggage_items_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let value = match urlencoding::decode(value.trim()) {
            Ok(value) => value.into_owned(),
            Err(_) => {
                counters.baggage_items_dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        context.baggage.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TraceId;
    use std::sync::Arc;

    fn counters() -> Arc<PipelineCounters> {
        Arc::new(PipelineCounters::default())
    }

    fn context_with(baggage: &[(&str, &str)]) -> SpanContext {
        let mut context = SpanContext::remote(TraceId::new(1, 0), 2);
        for (key, value) in baggage {
            context.set_baggage_item(key, value);
        }
        context
    }

    #[test]
    fn round_trip_plain_pairs() {
        let counters = counters();
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject(&context_with(&[("user", "alice"), ("team", "apm")]), &mut carrier, &counters);
        assert_eq!(carrier.get(BAGGAGE_HEADER).unwrap(), "team=apm,user=alice");

        let mut extracted = SpanContext::remote(TraceId::new(1, 0), 2);
        extract(&carrier, &mut extracted, &counters);
        assert_eq!(extracted.baggage_item("user"), Some("alice"));
        assert_eq!(extracted.baggage_item("team"), Some("apm"));
    }

    #[test]
    fn values_are_url_encoded() {
        let counters = counters();
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject(
            &context_with(&[("greeting", "hello world,friend")]),
            &mut carrier,
            &counters,
        );
        assert_eq!(
            carrier.get(BAGGAGE_HEADER).unwrap(),
            "greeting=hello%20world%2Cfriend"
        );

        let mut extracted = SpanContext::remote(TraceId::new(1, 0), 2);
        extract(&carrier, &mut extracted, &counters);
        assert_eq!(extracted.baggage_item("greeting"), Some("hello world,friend"));
    }

    #[test]
    fn item_budget_drops_overflow() {
        let counters = counters();
        let mut context = SpanContext::remote(TraceId::new(1, 0), 2);
        for i in 0..100 {
            context.set_baggage_item(&format!("key{i:03}"), "v");
        }
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject(&context, &mut carrier, &counters);
        let header = carrier.get(BAGGAGE_HEADER).unwrap();
        assert_eq!(header.split(',').count(), 64);
        assert_eq!(counters.baggage_items_dropped.load(Ordering::Relaxed), 36);
    }

    #[test]
    fn malformed_pairs_are_skipped_and_counted() {
        let counters = counters();
        let mut headers = HashMap::new();
        headers.insert(
            BAGGAGE_HEADER.to_string(),
            "valid=1,notapair,also=2".to_string(),
        );
        let mut context = SpanContext::remote(TraceId::new(1, 0), 2);
        extract(&headers, &mut context, &counters);
        assert_eq!(context.baggage.len(), 2);
        assert_eq!(counters.baggage_items_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn properties_are_stripped() {
        let counters = counters();
        let mut headers = HashMap::new();
        headers.insert(
            BAGGAGE_HEADER.to_string(),
            "user=alice;metadata=ignored".to_string(),
        );
        let mut context = SpanContext::remote(TraceId::new(1, 0), 2);
        extract(&headers, &mut context, &counters);
        assert_eq!(context.baggage_item("user"), Some("alice"));
    }
}
