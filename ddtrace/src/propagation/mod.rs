// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Context propagation across process boundaries.
//!
//! Each configured style independently reads or writes a carrier; on
//! extraction the first style producing a context wins, and disagreements
//! between Datadog and W3C identifiers are surfaced as trace-level tags.

mod b3;
mod baggage;
mod datadog;
mod tracecontext;

use crate::context::SpanContext;
use crate::worker::PipelineCounters;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Conflict tag carrying the W3C parent when it disagrees with Datadog's.
const PARENT_ID_CONFLICT_TAG: &str = "_dd.parent_id";

/// Write half of a carrier.
pub trait TextMapInjector {
    fn set(&mut self, key: &str, value: &str);
}

/// Read half of a carrier.
pub trait TextMapExtractor {
    /// Visit every key/value pair. Returning an error aborts extraction
    /// with [`ExtractError::InvalidCarrier`].
    fn for_each(&self, visitor: &mut dyn FnMut(&str, &str)) -> Result<(), ()>;
}

impl TextMapInjector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: &str) {
        self.insert(key.to_string(), value.to_string());
    }
}

impl TextMapExtractor for HashMap<String, String> {
    fn for_each(&self, visitor: &mut dyn FnMut(&str, &str)) -> Result<(), ()> {
        for (key, value) in self {
            visitor(key, value);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropagationStyle {
    Datadog,
    TraceContext,
    B3,
    B3Multi,
    None,
}

impl PropagationStyle {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "datadog" => Some(PropagationStyle::Datadog),
            "tracecontext" => Some(PropagationStyle::TraceContext),
            "b3" | "b3 single header" => Some(PropagationStyle::B3),
            "b3multi" => Some(PropagationStyle::B3Multi),
            "none" => Some(PropagationStyle::None),
            _ => None,
        }
    }
}

/// Injection failed before anything was written.
#[derive(Debug, PartialEq, Eq)]
pub enum InjectError {
    /// The context has no usable identifiers.
    InvalidContext,
}

impl fmt::Display for InjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectError::InvalidContext => write!(f, "span context is not injectable"),
        }
    }
}

impl std::error::Error for InjectError {}

/// Extraction failed; the kinds are distinguishable so callers can treat
/// absence differently from corruption.
#[derive(Debug, PartialEq, Eq)]
pub enum ExtractError {
    /// No configured style found headers in the carrier.
    NotFound,
    /// Headers were present but unusable.
    Malformed,
    /// The carrier itself reported an error while iterating.
    InvalidCarrier,
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::NotFound => write!(f, "no trace context found in carrier"),
            ExtractError::Malformed => write!(f, "trace context headers are malformed"),
            ExtractError::InvalidCarrier => write!(f, "carrier iteration failed"),
        }
    }
}

impl std::error::Error for ExtractError {}

pub(crate) struct Propagator {
    inject_styles: Vec<PropagationStyle>,
    extract_styles: Vec<PropagationStyle>,
    counters: Arc<PipelineCounters>,
}

impl Propagator {
    pub fn new(
        inject_styles: Vec<PropagationStyle>,
        extract_styles: Vec<PropagationStyle>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Propagator {
            inject_styles,
            extract_styles,
            counters,
        }
    }

    pub fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn TextMapInjector,
    ) -> Result<(), InjectError> {
        if !context.is_valid() {
            return Err(InjectError::InvalidContext);
        }
        for style in &self.inject_styles {
            match style {
                PropagationStyle::Datadog => datadog::inject(context, carrier),
                PropagationStyle::TraceContext => tracecontext::inject(context, carrier),
                PropagationStyle::B3 => b3::inject_single(context, carrier),
                PropagationStyle::B3Multi => b3::inject_multi(context, carrier),
                PropagationStyle::None => {}
            }
        }
        baggage::inject(context, carrier, &self.counters);
        Ok(())
    }

    pub fn extract(&self, carrier: &dyn TextMapExtractor) -> Result<SpanContext, ExtractError> {
        // Snapshot the carrier once; styles parse from the snapshot.
        let mut headers: HashMap<String, String> = HashMap::new();
        carrier
            .for_each(&mut |key, value| {
                headers.insert(key.to_ascii_lowercase(), value.trim().to_string());
            })
            .map_err(|_| ExtractError::InvalidCarrier)?;

        let mut primary: Option<(PropagationStyle, SpanContext)> = None;
        let mut malformed = false;
        let mut extracted: Vec<(PropagationStyle, SpanContext)> = Vec::new();
        for style in &self.extract_styles {
            let result = match style {
                PropagationStyle::Datadog => datadog::extract(&headers),
                PropagationStyle::TraceContext => tracecontext::extract(&headers),
                PropagationStyle::B3 => b3::extract_single(&headers),
                PropagationStyle::B3Multi => b3::extract_multi(&headers),
                PropagationStyle::None => Ok(None),
            };
            match result {
                Ok(Some(context)) => {
                    if primary.is_none() {
                        primary = Some((*style, context.clone()));
                    }
                    extracted.push((*style, context));
                }
                Ok(None) => {}
                Err(()) => malformed = true,
            }
        }

        let (winner, mut context) = match primary {
            Some(primary) => primary,
            None if malformed => return Err(ExtractError::Malformed),
            None => return Err(ExtractError::NotFound),
        };

        if winner != PropagationStyle::TraceContext {
            reconcile(&mut context, &extracted);
        }
        baggage::extract(&headers, &mut context, &self.counters);
        Ok(context)
    }
}

/// Surface identifier disagreements between the winning context and a W3C
/// context extracted alongside it.
fn reconcile(context: &mut SpanContext, extracted: &[(PropagationStyle, SpanContext)]) {
    let Some((_, w3c)) = extracted
        .iter()
        .find(|(style, _)| *style == PropagationStyle::TraceContext)
    else {
        return;
    };
    if w3c.trace_id.lower != context.trace_id.lower {
        return;
    }
    if w3c.trace_id.upper != 0 && context.trace_id.upper == 0 {
        context.trace_id.upper = w3c.trace_id.upper;
        context.propagating_tags.insert(
            crate::context::TRACE_ID_UPPER_TAG.to_string(),
            w3c.trace_id.upper_hex(),
        );
    }
    if w3c.span_id != context.span_id {
        context.propagating_tags.insert(
            PARENT_ID_CONFLICT_TAG.to_string(),
            format!("{:016x}", w3c.span_id),
        );
    }
}


/// Apply configured `header -> tag` pairs against a carrier snapshot.
pub(crate) fn header_tags_from(
    headers: &dyn TextMapExtractor,
    pairs: &[(String, String)],
) -> Vec<(String, String)> {
    let mut snapshot: HashMap<String, String> = HashMap::new();
    let _ = headers.for_each(&mut |key, value| {
        snapshot.insert(key.to_ascii_lowercase(), value.to_string());
    });
    pairs
        .iter()
        .filter_map(|(header, tag)| {
            snapshot
                .get(header)
                .map(|value| (tag.clone(), value.trim().to_string()))
        })
        .collect()
}
