// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The Datadog header style.

use crate::context::{SpanContext, TraceId, TRACE_ID_UPPER_TAG};
use crate::propagation::TextMapInjector;
use std::collections::HashMap;

pub(super) const TRACE_ID_HEADER: &str = "x-datadog-trace-id";
pub(super) const PARENT_ID_HEADER: &str = "x-datadog-parent-id";
pub(super) const SAMPLING_PRIORITY_HEADER: &str = "x-datadog-sampling-priority";
pub(super) const ORIGIN_HEADER: &str = "x-datadog-origin";
pub(super) const TAGS_HEADER: &str = "x-datadog-tags";

pub(super) fn inject(context: &SpanContext, carrier: &mut dyn TextMapInjector) {
    carrier.set(TRACE_ID_HEADER, &context.trace_id.lower.to_string());
    carrier.set(PARENT_ID_HEADER, &context.span_id.to_string());
    if let Some(priority) = context.sampling_priority {
        carrier.set(SAMPLING_PRIORITY_HEADER, &priority.to_string());
    }
    if !context.origin.is_empty() {
        carrier.set(ORIGIN_HEADER, &context.origin);
    }

    let mut tags: Vec<String> = context
        .wire_tags()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    if context.trace_id.upper != 0 && !context.propagating_tags.contains_key(TRACE_ID_UPPER_TAG) {
        tags.push(format!("{TRACE_ID_UPPER_TAG}={}", context.trace_id.upper_hex()));
    }
    if !tags.is_empty() {
        tags.sort();
        carrier.set(TAGS_HEADER, &tags.join(","));
    }
}

/// `Ok(None)` when no Datadog headers are present, `Err` when they are
/// present but unusable.
pub(super) fn extract(headers: &HashMap<String, String>) -> Result<Option<SpanContext>, ()> {
    let Some(trace_id_raw) = headers.get(TRACE_ID_HEADER) else {
        return Ok(None);
    };
    let lower: u64 = trace_id_raw.parse().map_err(|_| ())?;
    if lower == 0 {
        return Err(());
    }
    let span_id: u64 = headers
        .get(PARENT_ID_HEADER)
        .ok_or(())?
        .parse()
        .map_err(|_| ())?;

    let mut context = SpanContext::remote(TraceId::new(lower, 0), span_id);
    if let Some(priority) = headers.get(SAMPLING_PRIORITY_HEADER) {
        context.sampling_priority = Some(priority.parse().map_err(|_| ())?);
    }
    if let Some(origin) = headers.get(ORIGIN_HEADER) {
        context.origin = origin.clone();
    }
    if let Some(tags) = headers.get(TAGS_HEADER) {
        for pair in tags.split(',') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if !key.starts_with(crate::context::PROPAGATING_TAG_PREFIX) {
                continue;
            }
            context
                .propagating_tags
                .insert(key.to_string(), value.to_string());
        }
        if let Some(upper_hex) = context.propagating_tags.get(TRACE_ID_UPPER_TAG) {
            context.trace_id.upper = u64::from_str_radix(upper_hex, 16).unwrap_or(0);
        }
    }
    Ok(Some(context))
}
