// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

/// The identity headers the tracer attaches to every trace POST, fixed names
/// for agent compatibility.
#[derive(Default, Debug, Clone)]
pub struct TracerHeaderTags<'a> {
    pub lang: &'a str,
    pub lang_version: &'a str,
    pub lang_interpreter: &'a str,
    pub lang_vendor: &'a str,
    pub tracer_version: &'a str,
    pub container_id: &'a str,
    // Set when the client has marked top-level spans itself. Any non-empty
    // value means 'yes'.
    pub client_computed_top_level: bool,
    // Set when the client has computed stats so that the agent doesn't have
    // to. Any non-empty value means 'yes'.
    pub client_computed_stats: bool,
    // Number of trace chunks dropped client-side.
    pub dropped_p0_traces: usize,
    // Number of spans dropped client-side.
    pub dropped_p0_spans: usize,
}

impl<'a> From<TracerHeaderTags<'a>> for HashMap<&'static str, String> {
    fn from(tags: TracerHeaderTags<'a>) -> HashMap<&'static str, String> {
        let mut headers = HashMap::from([
            ("datadog-meta-lang", tags.lang.to_string()),
            ("datadog-meta-lang-version", tags.lang_version.to_string()),
            (
                "datadog-meta-lang-interpreter",
                tags.lang_interpreter.to_string(),
            ),
            (
                "datadog-meta-lang-interpreter-vendor",
                tags.lang_vendor.to_string(),
            ),
            (
                "datadog-meta-tracer-version",
                tags.tracer_version.to_string(),
            ),
            ("datadog-container-id", tags.container_id.to_string()),
            (
                "datadog-client-computed-stats",
                if tags.client_computed_stats {
                    "true".to_string()
                } else {
                    String::new()
                },
            ),
            (
                "datadog-client-computed-top-level",
                if tags.client_computed_top_level {
                    "true".to_string()
                } else {
                    String::new()
                },
            ),
            (
                "datadog-client-dropped-p0-traces",
                if tags.dropped_p0_traces > 0 {
                    tags.dropped_p0_traces.to_string()
                } else {
                    String::new()
                },
            ),
            (
                "datadog-client-dropped-p0-spans",
                if tags.dropped_p0_spans > 0 {
                    tags.dropped_p0_spans.to_string()
                } else {
                    String::new()
                },
            ),
        ]);
        headers.retain(|_, v| !v.is_empty());
        headers
    }
}
