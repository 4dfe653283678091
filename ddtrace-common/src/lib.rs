// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

pub mod client;
pub mod entity_id;
pub mod glob;
pub mod id;
pub mod rate_limiter;
pub mod tag;
pub mod time;

/// Extension trait for `Mutex` acquiring the lock and panicking if it is
/// poisoned.
///
/// A poisoned lock means another thread panicked while mutating tracer
/// state; continuing with that state would be worse than propagating the
/// panic.
pub trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}

pub mod header {
    #![allow(clippy::declare_interior_mutable_const)]
    use hyper::{header::HeaderName, http::HeaderValue};

    // These strings are defined separately to be used in contexts where &str
    // are used to represent headers while keeping a single source of truth.
    pub const DATADOG_TRACE_COUNT_STR: &str = "x-datadog-trace-count";
    pub const APPLICATION_MSGPACK_STR: &str = "application/msgpack";

    pub const DATADOG_CONTAINER_ID: HeaderName = HeaderName::from_static("datadog-container-id");
    pub const DATADOG_TRACE_COUNT: HeaderName = HeaderName::from_static(DATADOG_TRACE_COUNT_STR);
    pub const DATADOG_AGENT_STATE: HeaderName = HeaderName::from_static("datadog-agent-state");
    pub const APPLICATION_JSON: HeaderValue = HeaderValue::from_static("application/json");
    pub const APPLICATION_MSGPACK: HeaderValue = HeaderValue::from_static(APPLICATION_MSGPACK_STR);
}

pub type HttpRequestBuilder = hyper::http::request::Builder;

/// A target the tracer talks to: the trace agent's base URL or one of its
/// sub-endpoints, plus the per-request timeout applied to every call.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Endpoint {
    pub url: hyper::Uri,
    pub timeout_ms: u64,
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint {
            url: hyper::Uri::default(),
            timeout_ms: Self::DEFAULT_TIMEOUT,
        }
    }
}

impl Endpoint {
    /// Default value for the timeout field in milliseconds.
    pub const DEFAULT_TIMEOUT: u64 = 10_000;

    #[inline]
    pub fn from_url(url: hyper::Uri) -> Endpoint {
        Endpoint {
            url,
            ..Default::default()
        }
    }

    /// Set a custom timeout for this endpoint. Pass 0 to keep the default.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = if timeout_ms == 0 {
            Self::DEFAULT_TIMEOUT
        } else {
            timeout_ms
        };
        self
    }

    /// Return a request builder targeting this endpoint with the user-agent
    /// and container entity headers already applied.
    pub fn to_request_builder(&self, user_agent: &str) -> anyhow::Result<HttpRequestBuilder> {
        let mut builder = hyper::Request::builder()
            .uri(self.url.clone())
            .header(hyper::header::USER_AGENT, user_agent);

        if let Some(container_id) = entity_id::get_container_id() {
            builder = builder.header(header::DATADOG_CONTAINER_ID, container_id);
        }

        Ok(builder)
    }

    /// Return a new endpoint with `path` appended to this endpoint's URL.
    pub fn join_path(&self, path: &str) -> anyhow::Result<Endpoint> {
        let mut parts = self.url.clone().into_parts();
        parts.path_and_query = Some(hyper::http::uri::PathAndQuery::from_str(path)?);
        Ok(Endpoint {
            url: hyper::Uri::from_parts(parts)?,
            timeout_ms: self.timeout_ms,
        })
    }
}

/// Parse an agent URL. Only http and https schemes are accepted; a bare
/// `host:port` is promoted to `http://host:port`.
pub fn parse_uri(uri: &str) -> anyhow::Result<hyper::Uri> {
    let candidate: Cow<str> = if uri.contains("://") {
        Cow::Borrowed(uri)
    } else {
        Cow::Owned(format!("http://{uri}"))
    };
    let parsed = hyper::Uri::from_str(&candidate)?;
    match parsed.scheme_str() {
        Some("http") | Some("https") => Ok(parsed),
        other => anyhow::bail!("unsupported agent url scheme: {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_uri_promotes_bare_authority() {
        let uri = parse_uri("localhost:8126").unwrap();
        assert_eq!(uri.scheme_str(), Some("http"));
        assert_eq!(uri.authority().unwrap().as_str(), "localhost:8126");
    }

    #[test]
    fn parse_uri_rejects_unknown_scheme() {
        assert!(parse_uri("unix:///var/run/datadog/apm.socket").is_err());
    }

    #[test]
    fn join_path_replaces_path() {
        let endpoint = Endpoint::from_url("http://localhost:8126".parse().unwrap());
        let stats = endpoint.join_path("/v0.6/stats").unwrap();
        assert_eq!(stats.url.to_string(), "http://localhost:8126/v0.6/stats");
        assert_eq!(stats.timeout_ms, Endpoint::DEFAULT_TIMEOUT);
    }

    #[test]
    fn endpoint_zero_timeout_falls_back_to_default() {
        let endpoint = Endpoint::default().with_timeout(0);
        assert_eq!(endpoint.timeout_ms, Endpoint::DEFAULT_TIMEOUT);
    }
}
