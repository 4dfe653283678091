// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire shape of the `/v0.6/stats` payload. Field names are the PascalCase
//! identifiers the agent's decoder expects.

use serde::Serialize;

/// Not-quite-a-bool the agent uses for fields added after the format shipped.
pub mod trilean {
    pub const NOT_SET: u32 = 0;
    pub const TRUE: u32 = 1;
    pub const FALSE: u32 = 2;
}

/// One aggregation key's counters within a bucket.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ClientGroupedStats {
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Resource")]
    pub resource: String,
    #[serde(rename = "HTTPStatusCode")]
    pub http_status_code: u32,
    #[serde(rename = "Type")]
    pub r#type: String,
    #[serde(rename = "DBType")]
    pub db_type: String,
    #[serde(rename = "Hits")]
    pub hits: u64,
    #[serde(rename = "Errors")]
    pub errors: u64,
    #[serde(rename = "Duration")]
    pub duration: u64,
    #[serde(rename = "OkSummary", with = "serde_bytes")]
    pub ok_summary: Vec<u8>,
    #[serde(rename = "ErrorSummary", with = "serde_bytes")]
    pub error_summary: Vec<u8>,
    #[serde(rename = "Synthetics")]
    pub synthetics: bool,
    #[serde(rename = "TopLevelHits")]
    pub top_level_hits: u64,
    #[serde(rename = "SpanKind")]
    pub span_kind: String,
    #[serde(rename = "PeerTags")]
    pub peer_tags: Vec<String>,
    #[serde(rename = "IsTraceRoot")]
    pub is_trace_root: u32,
}

/// All aggregation keys observed in one aligned time window.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ClientStatsBucket {
    #[serde(rename = "Start")]
    pub start: u64,
    #[serde(rename = "Duration")]
    pub duration: u64,
    #[serde(rename = "Stats")]
    pub stats: Vec<ClientGroupedStats>,
    /// Agent-only field, always zero client-side.
    #[serde(rename = "AgentTimeShift")]
    pub agent_time_shift: i64,
}

/// The envelope POSTed to the stats endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ClientStatsPayload {
    #[serde(rename = "Hostname")]
    pub hostname: String,
    #[serde(rename = "Env")]
    pub env: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "Stats")]
    pub stats: Vec<ClientStatsBucket>,
    #[serde(rename = "Lang")]
    pub lang: String,
    #[serde(rename = "TracerVersion")]
    pub tracer_version: String,
    #[serde(rename = "RuntimeID")]
    pub runtime_id: String,
    #[serde(rename = "Sequence")]
    pub sequence: u64,
    /// Agent-only field, empty client-side.
    #[serde(rename = "AgentAggregation")]
    pub agent_aggregation: String,
    #[serde(rename = "Service")]
    pub service: String,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    #[serde(rename = "Tags")]
    pub tags: Vec<String>,
    #[serde(rename = "GitCommitSha")]
    pub git_commit_sha: String,
}
