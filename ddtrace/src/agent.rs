// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent capability discovery over `GET /info`.

use arc_swap::ArcSwapOption;
use ddtrace_common::client::{new_default_client, read_body, Body, HttpClient};
use ddtrace_common::{header, Endpoint};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often the info endpoint is re-probed.
pub(crate) const FETCH_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Wrapper for an info response storing the state hash from the agent.
#[derive(Clone, Deserialize, Default, Debug, PartialEq)]
pub(crate) struct AgentInfo {
    pub state_hash: String,
    pub info: AgentInfoStruct,
}

/// Schema of an agent info response; only the fields this client acts on.
#[derive(Clone, Deserialize, Default, Debug, PartialEq)]
pub(crate) struct AgentInfoStruct {
    pub version: Option<String>,
    /// List of available endpoints.
    pub endpoints: Option<Vec<String>>,
    /// Whether the agent accepts client-side p0 drops.
    pub client_drop_p0s: Option<bool>,
    /// Obfuscation behavior version implemented agent-side.
    pub obfuscation_version: Option<u32>,
    pub config: Option<AgentConfig>,
    /// Keys mapped to peer tags in stats aggregation.
    pub peer_tags: Option<Vec<String>>,
    /// Span kinds eligible for stats computation.
    pub span_kinds_stats_computed: Option<Vec<String>>,
}

#[derive(Clone, Deserialize, Default, Debug, PartialEq)]
pub(crate) struct AgentConfig {
    pub default_env: Option<String>,
}

enum FetchInfoStatus {
    SameState,
    NewState(Box<AgentInfo>),
}

/// Fetches `/info` on a fixed cadence, caching the latest response behind an
/// atomic pointer. The `datadog-agent-state` hash short-circuits identical
/// responses.
pub(crate) struct AgentInfoFetcher {
    endpoint: Endpoint,
    client: HttpClient,
    info: ArcSwapOption<AgentInfo>,
}

impl AgentInfoFetcher {
    pub fn new(agent_url: &hyper::Uri) -> anyhow::Result<Self> {
        let endpoint = Endpoint::from_url(agent_url.clone()).join_path("/info")?;
        Ok(AgentInfoFetcher {
            endpoint,
            client: new_default_client(),
            info: ArcSwapOption::new(None),
        })
    }

    pub fn info(&self) -> Option<Arc<AgentInfo>> {
        self.info.load_full()
    }

    pub fn drop_p0s_allowed(&self) -> bool {
        self.info()
            .and_then(|info| info.info.client_drop_p0s)
            .unwrap_or(false)
    }

    pub fn stats_endpoint_supported(&self) -> bool {
        self.info()
            .and_then(|info| {
                info.info
                    .endpoints
                    .as_ref()
                    .map(|endpoints| endpoints.iter().any(|e| e == ddtrace_stats::STATS_ENDPOINT))
            })
            .unwrap_or(true)
    }

    pub fn default_env(&self) -> Option<String> {
        self.info()
            .and_then(|info| info.info.config.as_ref().and_then(|c| c.default_env.clone()))
    }

    async fn fetch_info(&self, current_state_hash: Option<&str>) -> anyhow::Result<FetchInfoStatus> {
        let req = self
            .endpoint
            .to_request_builder(concat!("Tracer/", env!("CARGO_PKG_VERSION")))?
            .method(hyper::Method::GET)
            .body(Body::from(bytes::Bytes::new()))?;
        let res = tokio::time::timeout(
            Duration::from_millis(self.endpoint.timeout_ms),
            self.client.request(req),
        )
        .await
        .map_err(|_| anyhow::anyhow!("info request timed out"))??;

        let new_state_hash = res
            .headers()
            .get(header::DATADOG_AGENT_STATE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !new_state_hash.is_empty() && current_state_hash == Some(new_state_hash.as_str()) {
            return Ok(FetchInfoStatus::SameState);
        }
        let body = read_body(res).await?;
        let info = Box::new(AgentInfo {
            state_hash: new_state_hash,
            info: serde_json::from_slice(&body)?,
        });
        Ok(FetchInfoStatus::NewState(info))
    }

    /// One probe; returns true when the cache was updated.
    pub async fn fetch_once(&self) -> bool {
        let current = self.info.load_full();
        let current_hash = current.as_ref().map(|info| info.state_hash.as_str());
        match self.fetch_info(current_hash).await {
            Ok(FetchInfoStatus::NewState(new_info)) => {
                debug!(version = ?new_info.info.version, "Agent info updated");
                self.info.store(Some(Arc::new(*new_info)));
                true
            }
            Ok(FetchInfoStatus::SameState) => false,
            Err(error) => {
                warn!(%error, "Failed to fetch agent info");
                false
            }
        }
    }

    /// Probe immediately, then on the fetch interval until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            self.fetch_once().await;
            tokio::select! {
                _ = tokio::time::sleep(FETCH_INTERVAL) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::MockServer;

    const TEST_INFO: &str = r#"{
        "version": "7.54.0",
        "endpoints": ["/v0.4/traces", "/v0.6/stats"],
        "client_drop_p0s": true,
        "obfuscation_version": 1,
        "config": {"default_env": "none"},
        "peer_tags": ["db.hostname"],
        "span_kinds_stats_computed": ["server", "client"]
    }"#;

    fn fetcher(server: &MockServer) -> AgentInfoFetcher {
        AgentInfoFetcher::new(&server.url("").parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn fetch_parses_capabilities() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/info");
                then.status(200)
                    .header("content-type", "application/json")
                    .header("datadog-agent-state", "hash-1")
                    .body(TEST_INFO);
            })
            .await;

        let fetcher = fetcher(&server);
        assert!(fetcher.info().is_none());
        assert!(fetcher.fetch_once().await);
        mock.assert_async().await;

        let info = fetcher.info().unwrap();
        assert_eq!(info.state_hash, "hash-1");
        assert_eq!(info.info.obfuscation_version, Some(1));
        assert!(fetcher.drop_p0s_allowed());
        assert!(fetcher.stats_endpoint_supported());
        assert_eq!(fetcher.default_env().as_deref(), Some("none"));
    }

    #[tokio::test]
    async fn same_state_hash_short_circuits() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.path("/info");
                then.status(200)
                    .header("datadog-agent-state", "stable")
                    .body(TEST_INFO);
            })
            .await;

        let fetcher = fetcher(&server);
        assert!(fetcher.fetch_once().await);
        assert!(!fetcher.fetch_once().await);
        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn fetch_failure_keeps_previous_info() {
        let server = MockServer::start_async().await;
        let ok_mock = server
            .mock_async(|when, then| {
                when.path("/info");
                then.status(200)
                    .header("datadog-agent-state", "h1")
                    .body(TEST_INFO);
            })
            .await;
        let fetcher = fetcher(&server);
        assert!(fetcher.fetch_once().await);
        ok_mock.delete_async().await;
        server
            .mock_async(|when, then| {
                when.path("/info");
                then.status(500).body("agent restarting");
            })
            .await;

        assert!(!fetcher.fetch_once().await);
        assert!(fetcher.info().is_some());
    }

    #[tokio::test]
    async fn no_info_defaults_are_conservative() {
        let server = MockServer::start_async().await;
        let fetcher = fetcher(&server);
        assert!(!fetcher.drop_p0s_allowed());
        // Stats stay on until the agent says otherwise.
        assert!(fetcher.stats_endpoint_supported());
    }
}
