// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! B3 propagation, both the multi-header and single-header variants.

use crate::context::{SpanContext, TraceId};
use crate::propagation::TextMapInjector;
use std::collections::HashMap;

pub(super) const B3_SINGLE_HEADER: &str = "b3";
pub(super) const B3_TRACE_ID_HEADER: &str = "x-b3-traceid";
pub(super) const B3_SPAN_ID_HEADER: &str = "x-b3-spanid";
pub(super) const B3_SAMPLED_HEADER: &str = "x-b3-sampled";

fn sampled_flag(context: &SpanContext) -> &'static str {
    if context.sampling_priority.unwrap_or(0) > 0 {
        "1"
    } else {
        "0"
    }
}

fn trace_id_hex(trace_id: TraceId) -> String {
    if trace_id.upper != 0 {
        format!("{:032x}", trace_id.as_u128())
    } else {
        format!("{:016x}", trace_id.lower)
    }
}

pub(super) fn inject_multi(context: &SpanContext, carrier: &mut dyn TextMapInjector) {
    carrier.set(B3_TRACE_ID_HEADER, &trace_id_hex(context.trace_id));
    carrier.set(B3_SPAN_ID_HEADER, &format!("{:016x}", context.span_id));
    carrier.set(B3_SAMPLED_HEADER, sampled_flag(context));
}

pub(super) fn inject_single(context: &SpanContext, carrier: &mut dyn TextMapInjector) {
    carrier.set(
        B3_SINGLE_HEADER,
        &format!(
            "{}-{:016x}-{}",
            trace_id_hex(context.trace_id),
            context.span_id,
            sampled_flag(context)
        ),
    );
}

fn parse_trace_id(hex: &str) -> Result<TraceId, ()> {
    match hex.len() {
        16 => {
            let lower = u64::from_str_radix(hex, 16).map_err(|_| ())?;
            Ok(TraceId::new(lower, 0))
        }
        32 => {
            let full = u128::from_str_radix(hex, 16).map_err(|_| ())?;
            Ok(TraceId::from_u128(full))
        }
        _ => Err(()),
    }
}

fn parse_sampled(value: &str) -> Option<i32> {
    match value {
        "1" | "d" | "true" => Some(1),
        "0" | "false" => Some(0),
        _ => None,
    }
}

pub(super) fn extract_multi(headers: &HashMap<String, String>) -> Result<Option<SpanContext>, ()> {
    let Some(trace_id_hex) = headers.get(B3_TRACE_ID_HEADER) else {
        return Ok(None);
    };
    let trace_id = parse_trace_id(trace_id_hex)?;
    let span_id = u64::from_str_radix(headers.get(B3_SPAN_ID_HEADER).ok_or(())?, 16)
        .map_err(|_| ())?;
    if trace_id.is_zero() || span_id == 0 {
        return Err(());
    }
    let mut context = SpanContext::remote(trace_id, span_id);
    if let Some(sampled) = headers.get(B3_SAMPLED_HEADER) {
        context.sampling_priority = parse_sampled(sampled);
    }
    Ok(Some(context))
}

pub(super) fn extract_single(headers: &HashMap<String, String>) -> Result<Option<SpanContext>, ()> {
    let Some(value) = headers.get(B3_SINGLE_HEADER) else {
        return Ok(None);
    };
    let mut parts = value.split('-');
    let trace_id = parse_trace_id(parts.next().ok_or(())?)?;
    let span_id = u64::from_str_radix(parts.next().ok_or(())?, 16).map_err(|_| ())?;
    if trace_id.is_zero() || span_id == 0 {
        return Err(());
    }
    let mut context = SpanContext::remote(trace_id, span_id);
    if let Some(sampled) = parts.next() {
        context.sampling_priority = parse_sampled(sampled);
    }
    Ok(Some(context))
}
