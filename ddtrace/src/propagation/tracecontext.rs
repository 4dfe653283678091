// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! W3C trace context: `traceparent` and the `dd=` member of `tracestate`.

use crate::context::{SpanContext, TraceId, PROPAGATING_TAG_PREFIX, TRACE_ID_UPPER_TAG};
use crate::propagation::TextMapInjector;
use std::collections::HashMap;

pub(super) const TRACEPARENT_HEADER: &str = "traceparent";
pub(super) const TRACESTATE_HEADER: &str = "tracestate";

pub(super) fn inject(context: &SpanContext, carrier: &mut dyn TextMapInjector) {
    let sampled = if context.sampling_priority.unwrap_or(0) > 0 {
        "01"
    } else {
        "00"
    };
    carrier.set(
        TRACEPARENT_HEADER,
        &format!(
            "00-{:032x}-{:016x}-{sampled}",
            context.trace_id.as_u128(),
            context.span_id
        ),
    );

    let mut members = Vec::new();
    if let Some(priority) = context.sampling_priority {
        members.push(format!("s:{priority}"));
    }
    if !context.origin.is_empty() {
        members.push(format!("o:{}", tracestate_escape(&context.origin)));
    }
    let mut tag_members: Vec<String> = context
        .wire_tags()
        .filter(|(key, _)| key.as_str() != TRACE_ID_UPPER_TAG)
        .filter_map(|(key, value)| {
            key.strip_prefix(PROPAGATING_TAG_PREFIX)
                .map(|short| format!("t.{short}:{}", tracestate_escape(value)))
        })
        .collect();
    tag_members.sort();
    members.extend(tag_members);
    if !members.is_empty() {
        carrier.set(TRACESTATE_HEADER, &format!("dd={}", members.join(";")));
    }
}

// The tracestate value charset forbids '=' and ','; both travel as '~'
// and '_' respectively.
fn tracestate_escape(value: &str) -> String {
    value.replace('=', "~").replace(',', "_")
}

fn tracestate_unescape(value: &str) -> String {
    value.replace('~', "=")
}

pub(super) fn extract(headers: &HashMap<String, String>) -> Result<Option<SpanContext>, ()> {
    let Some(traceparent) = headers.get(TRACEPARENT_HEADER) else {
        return Ok(None);
    };
    let parts: Vec<&str> = traceparent.trim().split('-').collect();
    if parts.len() < 4 {
        return Err(());
    }
    let (version, trace_id_hex, span_id_hex, flags_hex) =
        (parts[0], parts[1], parts[2], parts[3]);
    if version.len() != 2 || version == "ff" {
        return Err(());
    }
    u8::from_str_radix(version, 16).map_err(|_| ())?;
    if trace_id_hex.len() != 32 || span_id_hex.len() != 16 || flags_hex.len() != 2 {
        return Err(());
    }
    let trace_id = u128::from_str_radix(trace_id_hex, 16).map_err(|_| ())?;
    let span_id = u64::from_str_radix(span_id_hex, 16).map_err(|_| ())?;
    let flags = u8::from_str_radix(flags_hex, 16).map_err(|_| ())?;
    if trace_id == 0 || span_id == 0 {
        return Err(());
    }

    let mut context = SpanContext::remote(TraceId::from_u128(trace_id), span_id);
    context.sampling_priority = Some(i32::from(flags & 1));

    if let Some(tracestate) = headers.get(TRACESTATE_HEADER) {
        if let Some(dd_member) = tracestate
            .split(',')
            .map(str::trim)
            .find_map(|member| member.strip_prefix("dd="))
        {
            for entry in dd_member.split(';') {
                let Some((key, value)) = entry.split_once(':') else {
                    continue;
                };
                match key {
                    "s" => {
                        if let Ok(priority) = value.parse::<i32>() {
                            // The upstream priority wins over the flag bit as
                            // long as they agree on keep/drop.
                            let sampled = flags & 1 == 1;
                            if (priority > 0) == sampled {
                                context.sampling_priority = Some(priority);
                            }
                        }
                    }
                    "o" => context.origin = tracestate_unescape(value),
                    _ => {
                        if let Some(short) = key.strip_prefix("t.") {
                            context.propagating_tags.insert(
                                format!("{PROPAGATING_TAG_PREFIX}{short}"),
                                tracestate_unescape(value),
                            );
                        }
                    }
                }
            }
        }
    }

    if context.trace_id.upper != 0 {
        context.propagating_tags.insert(
            TRACE_ID_UPPER_TAG.to_string(),
            context.trace_id.upper_hex(),
        );
    }
    Ok(Some(context))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inject_formats_traceparent() {
        let mut context = SpanContext::remote(TraceId::new(42, 7), 99);
        context.sampling_priority = Some(2);
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject(&context, &mut carrier);
        assert_eq!(
            carrier.get(TRACEPARENT_HEADER).unwrap(),
            "00-0000000000000007000000000000002a-0000000000000063-01"
        );
        assert_eq!(carrier.get(TRACESTATE_HEADER).unwrap(), "dd=s:2");
    }

    #[test]
    fn dropped_trace_has_zero_flags() {
        let mut context = SpanContext::remote(TraceId::new(1, 0), 2);
        context.sampling_priority = Some(-1);
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject(&context, &mut carrier);
        assert!(carrier.get(TRACEPARENT_HEADER).unwrap().ends_with("-00"));
    }

    #[test]
    fn extract_round_trips_ids_and_tags() {
        let mut context = SpanContext::remote(TraceId::new(42, 7), 99);
        context.sampling_priority = Some(1);
        context.origin = "rum".to_string();
        context
            .propagating_tags
            .insert("_dd.p.dm".to_string(), "-4".to_string());
        let mut carrier: HashMap<String, String> = HashMap::new();
        inject(&context, &mut carrier);

        let extracted = extract(&carrier).unwrap().unwrap();
        assert_eq!(extracted.trace_id.lower, 42);
        assert_eq!(extracted.trace_id.upper, 7);
        assert_eq!(extracted.span_id, 99);
        assert_eq!(extracted.sampling_priority, Some(1));
        assert_eq!(extracted.origin, "rum");
        assert_eq!(
            extracted.propagating_tags.get("_dd.p.dm").map(String::as_str),
            Some("-4")
        );
        assert_eq!(
            extracted.propagating_tags.get(TRACE_ID_UPPER_TAG).map(String::as_str),
            Some("0000000000000007")
        );
    }

    #[test]
    fn flag_disagreement_keeps_flag_decision() {
        let mut headers = HashMap::new();
        headers.insert(
            TRACEPARENT_HEADER.to_string(),
            "00-0000000000000000000000000000002a-0000000000000063-00".to_string(),
        );
        // tracestate says keep but the flags say drop.
        headers.insert(TRACESTATE_HEADER.to_string(), "dd=s:2".to_string());
        let context = extract(&headers).unwrap().unwrap();
        assert_eq!(context.sampling_priority, Some(0));
    }

    #[test]
    fn malformed_traceparent_is_an_error() {
        for bad in [
            "xx-00000000000000000000000000000001-0000000000000001-01",
            "00-1-2-01",
            "00-00000000000000000000000000000000-0000000000000001-01",
            "garbage",
        ] {
            let mut headers = HashMap::new();
            headers.insert(TRACEPARENT_HEADER.to_string(), bad.to_string());
            assert!(extract(&headers).is_err(), "{bad} should be malformed");
        }
    }

    #[test]
    fn foreign_tracestate_members_are_ignored() {
        let mut headers = HashMap::new();
        headers.insert(
            TRACEPARENT_HEADER.to_string(),
            "00-0000000000000000000000000000002a-0000000000000063-01".to_string(),
        );
        headers.insert(
            TRACESTATE_HEADER.to_string(),
            "other=vendor:1,dd=s:1;o:rum".to_string(),
        );
        let context = extract(&headers).unwrap().unwrap();
        assert_eq!(context.origin, "rum");
    }
}
