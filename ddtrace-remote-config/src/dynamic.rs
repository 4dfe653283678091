// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Parsing of the APM_TRACING dynamic-configuration product files.

use crate::Target;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Deserialize)]
pub struct DynamicConfigFile {
    #[serde(default)]
    pub action: String,
    pub service_target: Target,
    pub lib_config: DynamicConfig,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TracingHeaderTag {
    pub header: String,
    pub tag_name: String,
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TracingSamplingRuleProvenance {
    Customer,
    Dynamic,
}

#[derive(Debug, Deserialize)]
pub struct TracingSamplingRuleTag {
    pub key: String,
    pub value_glob: String,
}

#[derive(Debug, Deserialize)]
pub struct TracingSamplingRule {
    #[serde(default)]
    pub service: String,
    pub name: Option<String>,
    pub provenance: TracingSamplingRuleProvenance,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub tags: Vec<TracingSamplingRuleTag>,
    pub sample_rate: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct DynamicConfig {
    pub(crate) tracing_header_tags: Option<Vec<TracingHeaderTag>>,
    pub(crate) tracing_sample_rate: Option<f64>,
    pub(crate) tracing_tags: Option<Vec<String>>,
    pub(crate) tracing_enabled: Option<bool>,
    pub(crate) tracing_sampling_rules: Option<Vec<TracingSamplingRule>>,
}

impl DynamicConfig {
    /// An empty lib_config reverts the tracer to its local configuration.
    pub fn is_empty(&self) -> bool {
        self.tracing_header_tags.is_none()
            && self.tracing_sample_rate.is_none()
            && self.tracing_tags.is_none()
            && self.tracing_enabled.is_none()
            && self.tracing_sampling_rules.is_none()
    }
}

/// One typed configuration change carried by a lib_config payload.
pub enum Configs {
    TracingHeaderTags(HashMap<String, String>),
    TracingSampleRate(f64),
    TracingTags(Vec<String>), // "key:val" format
    TracingEnabled(bool),
    TracingSamplingRules(Vec<TracingSamplingRule>),
}

impl From<DynamicConfig> for Vec<Configs> {
    fn from(value: DynamicConfig) -> Self {
        let mut vec = vec![];
        if let Some(tags) = value.tracing_header_tags {
            vec.push(Configs::TracingHeaderTags(
                tags.into_iter().map(|t| (t.header, t.tag_name)).collect(),
            ))
        }
        if let Some(sample_rate) = value.tracing_sample_rate {
            vec.push(Configs::TracingSampleRate(sample_rate));
        }
        if let Some(tags) = value.tracing_tags {
            vec.push(Configs::TracingTags(tags));
        }
        if let Some(enabled) = value.tracing_enabled {
            vec.push(Configs::TracingEnabled(enabled));
        }
        if let Some(sampling_rules) = value.tracing_sampling_rules {
            vec.push(Configs::TracingSamplingRules(sampling_rules));
        }
        vec
    }
}

pub fn parse_json(data: &[u8]) -> serde_json::error::Result<DynamicConfigFile> {
    serde_json::from_slice(data)
}
