// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Chunk encoding and the structural decoder used to validate payloads.
//!
//! Encoding goes through `rmp_serde::to_vec_named` so the span structs'
//! serde attributes are the single source of truth for the wire layout. The
//! decoder is value-based (`rmpv`); it only runs in validation paths, never
//! on the hot path.

use crate::span::{AttributeAnyValue, AttributeArrayValue, Span, SpanEvent, SpanLink, TraceChunk};
use rmpv::Value;
use std::collections::HashMap;
use std::fmt;

/// Encode one trace chunk as a msgpack array of span maps.
pub fn encode_chunk(chunk: &[Span]) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::encode::to_vec_named(chunk)
}

#[derive(Debug, PartialEq)]
pub enum DecodeError {
    InvalidFormat(String),
    InvalidType(&'static str),
    Io(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidFormat(msg) => write!(f, "invalid payload format: {msg}"),
            DecodeError::InvalidType(what) => write!(f, "unexpected type for {what}"),
            DecodeError::Io(msg) => write!(f, "error reading payload: {msg}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a full trace payload (array of arrays of span maps).
pub fn decode_traces(mut bytes: &[u8]) -> Result<Vec<TraceChunk>, DecodeError> {
    let value =
        rmpv::decode::read_value(&mut bytes).map_err(|e| DecodeError::Io(e.to_string()))?;
    let traces = as_array(&value, "payload")?;
    traces
        .iter()
        .map(|trace| {
            let spans = as_array(trace, "trace")?;
            spans.iter().map(decode_span).collect()
        })
        .collect()
}

fn as_array<'a>(value: &'a Value, what: &'static str) -> Result<&'a Vec<Value>, DecodeError> {
    value.as_array().ok_or(DecodeError::InvalidType(what))
}

fn as_str(value: &Value, what: &'static str) -> Result<String, DecodeError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(DecodeError::InvalidType(what))
}

fn as_u64(value: &Value, what: &'static str) -> Result<u64, DecodeError> {
    value.as_u64().ok_or(DecodeError::InvalidType(what))
}

fn as_i64(value: &Value, what: &'static str) -> Result<i64, DecodeError> {
    value.as_i64().ok_or(DecodeError::InvalidType(what))
}

fn as_f64(value: &Value, what: &'static str) -> Result<f64, DecodeError> {
    value.as_f64().ok_or(DecodeError::InvalidType(what))
}

fn decode_string_map(value: &Value, what: &'static str) -> Result<HashMap<String, String>, DecodeError> {
    let entries = value.as_map().ok_or(DecodeError::InvalidType(what))?;
    entries
        .iter()
        .map(|(k, v)| Ok((as_str(k, what)?, as_str(v, what)?)))
        .collect()
}

fn decode_span(value: &Value) -> Result<Span, DecodeError> {
    let entries = value.as_map().ok_or(DecodeError::InvalidType("span"))?;
    let mut span = Span::default();
    for (key, value) in entries {
        match as_str(key, "span key")?.as_str() {
            "service" => span.service = as_str(value, "service")?,
            "name" => span.name = as_str(value, "name")?,
            "resource" => span.resource = as_str(value, "resource")?,
            "type" => span.r#type = as_str(value, "type")?,
            "trace_id" => span.trace_id = as_u64(value, "trace_id")? as u128,
            "span_id" => span.span_id = as_u64(value, "span_id")?,
            "parent_id" => span.parent_id = as_u64(value, "parent_id")?,
            "start" => span.start = as_i64(value, "start")?,
            "duration" => span.duration = as_i64(value, "duration")?,
            "error" => span.error = as_i64(value, "error")? as i32,
            "meta" => span.meta = decode_string_map(value, "meta")?,
            "metrics" => {
                let entries = value.as_map().ok_or(DecodeError::InvalidType("metrics"))?;
                span.metrics = entries
                    .iter()
                    .map(|(k, v)| Ok((as_str(k, "metrics")?, as_f64(v, "metrics")?)))
                    .collect::<Result<_, DecodeError>>()?;
            }
            "meta_struct" => {
                let entries = value
                    .as_map()
                    .ok_or(DecodeError::InvalidType("meta_struct"))?;
                span.meta_struct = entries
                    .iter()
                    .map(|(k, v)| {
                        let bytes = v
                            .as_slice()
                            .ok_or(DecodeError::InvalidType("meta_struct"))?;
                        Ok((as_str(k, "meta_struct")?, bytes.to_vec()))
                    })
                    .collect::<Result<_, DecodeError>>()?;
            }
            "span_links" => {
                span.span_links = as_array(value, "span_links")?
                    .iter()
                    .map(decode_span_link)
                    .collect::<Result<_, _>>()?;
            }
            "span_events" => {
                span.span_events = as_array(value, "span_events")?
                    .iter()
                    .map(decode_span_event)
                    .collect::<Result<_, _>>()?;
            }
            other => {
                return Err(DecodeError::InvalidFormat(format!(
                    "unknown span key: {other}"
                )))
            }
        }
    }
    Ok(span)
}

fn decode_span_link(value: &Value) -> Result<SpanLink, DecodeError> {
    let entries = value.as_map().ok_or(DecodeError::InvalidType("span link"))?;
    let mut link = SpanLink::default();
    for (key, value) in entries {
        match as_str(key, "span link key")?.as_str() {
            "trace_id" => link.trace_id = as_u64(value, "link trace_id")?,
            "trace_id_high" => link.trace_id_high = as_u64(value, "link trace_id_high")?,
            "span_id" => link.span_id = as_u64(value, "link span_id")?,
            "attributes" => link.attributes = decode_string_map(value, "link attributes")?,
            "tracestate" => link.tracestate = as_str(value, "link tracestate")?,
            "flags" => link.flags = as_u64(value, "link flags")? as u32,
            other => {
                return Err(DecodeError::InvalidFormat(format!(
                    "unknown span link key: {other}"
                )))
            }
        }
    }
    Ok(link)
}

fn decode_span_event(value: &Value) -> Result<SpanEvent, DecodeError> {
    let entries = value.as_map().ok_or(DecodeError::InvalidType("span event"))?;
    let mut event = SpanEvent::default();
    for (key, value) in entries {
        match as_str(key, "span event key")?.as_str() {
            "time_unix_nano" => event.time_unix_nano = as_u64(value, "event time")?,
            "name" => event.name = as_str(value, "event name")?,
            "attributes" => {
                let attributes = value
                    .as_map()
                    .ok_or(DecodeError::InvalidType("event attributes"))?;
                event.attributes = attributes
                    .iter()
                    .map(|(k, v)| Ok((as_str(k, "event attribute key")?, decode_attribute(v)?)))
                    .collect::<Result<_, DecodeError>>()?;
            }
            other => {
                return Err(DecodeError::InvalidFormat(format!(
                    "unknown span event key: {other}"
                )))
            }
        }
    }
    Ok(event)
}

fn decode_attribute(value: &Value) -> Result<AttributeAnyValue, DecodeError> {
    let entries = value
        .as_map()
        .ok_or(DecodeError::InvalidType("event attribute"))?;
    let attribute_type = entries
        .iter()
        .find(|(k, _)| k.as_str() == Some("type"))
        .and_then(|(_, v)| v.as_u64())
        .ok_or(DecodeError::InvalidType("event attribute type"))?;

    let field = |name: &str| {
        entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .map(|(_, v)| v)
            .ok_or_else(|| DecodeError::InvalidFormat(format!("missing attribute field {name}")))
    };

    match attribute_type {
        4 => {
            let wrapper = field("array_value")?
                .as_map()
                .ok_or(DecodeError::InvalidType("array_value"))?;
            let values = wrapper
                .iter()
                .find(|(k, _)| k.as_str() == Some("values"))
                .map(|(_, v)| v)
                .ok_or(DecodeError::InvalidType("array_value.values"))?;
            let scalars = as_array(values, "array_value.values")?
                .iter()
                .map(decode_scalar_attribute)
                .collect::<Result<_, _>>()?;
            Ok(AttributeAnyValue::Array(scalars))
        }
        _ => Ok(AttributeAnyValue::SingleValue(decode_scalar_attribute(
            value,
        )?)),
    }
}

fn decode_scalar_attribute(value: &Value) -> Result<AttributeArrayValue, DecodeError> {
    let entries = value
        .as_map()
        .ok_or(DecodeError::InvalidType("event attribute"))?;
    let attribute_type = entries
        .iter()
        .find(|(k, _)| k.as_str() == Some("type"))
        .and_then(|(_, v)| v.as_u64())
        .ok_or(DecodeError::InvalidType("event attribute type"))?;
    let field = |name: &str| {
        entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(name))
            .map(|(_, v)| v)
            .ok_or_else(|| DecodeError::InvalidFormat(format!("missing attribute field {name}")))
    };
    match attribute_type {
        0 => Ok(AttributeArrayValue::String(as_str(
            field("string_value")?,
            "string_value",
        )?)),
        1 => Ok(AttributeArrayValue::Boolean(
            field("bool_value")?
                .as_bool()
                .ok_or(DecodeError::InvalidType("bool_value"))?,
        )),
        2 => Ok(AttributeArrayValue::Integer(as_i64(
            field("int_value")?,
            "int_value",
        )?)),
        3 => Ok(AttributeArrayValue::Double(as_f64(
            field("double_value")?,
            "double_value",
        )?)),
        other => Err(DecodeError::InvalidFormat(format!(
            "unknown attribute type: {other}"
        ))),
    }
}
