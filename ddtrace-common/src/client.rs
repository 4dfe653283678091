// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hyper client construction shared by the trace, stats and info paths.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

pub type Body = Full<Bytes>;
pub type HttpClient = Client<HttpConnector, Body>;
pub type HttpResponse = hyper::Response<hyper::body::Incoming>;
pub type ClientError = hyper_util::client::legacy::Error;

/// Build the client used for all agent communication. Connections are pooled
/// by hyper-util; one client instance is shared per tracer.
pub fn new_default_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Drain a response body into a single buffer.
pub async fn read_body(response: HttpResponse) -> Result<Bytes, hyper::Error> {
    Ok(response.into_body().collect().await?.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HttpClient>();
    }
}
