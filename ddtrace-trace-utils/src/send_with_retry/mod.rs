// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Provide [`send_with_retry`] to POST a payload to an [`Endpoint`] with
//! retries if the request fails.

mod retry_strategy;
pub use retry_strategy::{RetryBackoffType, RetryStrategy};

use bytes::Bytes;
use ddtrace_common::client::{Body, ClientError, HttpClient, HttpResponse};
use ddtrace_common::Endpoint;
use hyper::Method;
use std::{collections::HashMap, time::Duration};
use tracing::{debug, error};

pub type Attempts = u32;

pub type SendWithRetryResult = Result<(HttpResponse, Attempts), SendWithRetryError>;

/// All errors carry the number of attempts after which they were returned.
#[derive(Debug)]
pub enum SendWithRetryError {
    /// The request received an error HTTP code.
    Http(HttpResponse, Attempts),
    /// The request timed out in the transport layer.
    Timeout(Attempts),
    /// Networking failure.
    Network(ClientError, Attempts),
    /// The request could not be built.
    Build(Attempts),
}

impl std::fmt::Display for SendWithRetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendWithRetryError::Http(_, _) => write!(f, "Http error code received"),
            SendWithRetryError::Timeout(_) => write!(f, "Request timed out"),
            SendWithRetryError::Network(error, _) => write!(f, "Network error: {error}"),
            SendWithRetryError::Build(_) => {
                write!(f, "Failed to build request due to invalid property")
            }
        }
    }
}

impl std::error::Error for SendWithRetryError {}

impl SendWithRetryError {
    pub fn attempts(&self) -> Attempts {
        match self {
            SendWithRetryError::Http(_, attempts)
            | SendWithRetryError::Timeout(attempts)
            | SendWithRetryError::Network(_, attempts)
            | SendWithRetryError::Build(attempts) => *attempts,
        }
    }

    fn from_request_error(err: RequestError, request_attempt: Attempts) -> Self {
        match err {
            RequestError::Build => SendWithRetryError::Build(request_attempt),
            RequestError::Network(error) => SendWithRetryError::Network(error, request_attempt),
            RequestError::TimeoutApi => SendWithRetryError::Timeout(request_attempt),
        }
    }
}

#[derive(Debug)]
enum RequestError {
    Build,
    Network(ClientError),
    TimeoutApi,
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::TimeoutApi => write!(f, "Api timeout exhausted"),
            RequestError::Network(error) => write!(f, "Network error: {error}"),
            RequestError::Build => write!(f, "Failed to build request due to invalid property"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Send `payload` with a POST request to `target`, retrying per
/// `retry_strategy` when the request fails.
///
/// Every attempt re-reads the same `Bytes` buffer; the payload is never
/// copied between retries. The per-attempt timeout is the endpoint's
/// `timeout_ms`.
pub async fn send_with_retry(
    client: &HttpClient,
    target: &Endpoint,
    payload: Bytes,
    headers: &HashMap<&'static str, String>,
    retry_strategy: &RetryStrategy,
) -> SendWithRetryResult {
    let mut request_attempt = 0;

    debug!(
        url = %target.url,
        payload_size = payload.len(),
        max_retries = retry_strategy.max_retries(),
        "Sending with retry"
    );

    loop {
        request_attempt += 1;

        let mut req = target
            .to_request_builder(concat!("Tracer/", env!("CARGO_PKG_VERSION")))
            .or(Err(SendWithRetryError::Build(request_attempt)))?
            .method(Method::POST);
        for (key, value) in headers {
            req = req.header(*key, value.clone());
        }

        match send_request(
            client,
            Duration::from_millis(target.timeout_ms),
            req,
            payload.clone(),
        )
        .await
        {
            // An Ok response doesn't necessarily mean the request succeeded;
            // non-2xx/3xx status codes are treated as retryable errors.
            Ok(response) => {
                let status = response.status();
                debug!(status = %status, attempt = request_attempt, "Received response");

                if status.is_client_error() || status.is_server_error() {
                    if request_attempt < retry_strategy.max_retries() {
                        retry_strategy.delay(request_attempt).await;
                        continue;
                    } else {
                        error!(
                            status = %status,
                            attempts = request_attempt,
                            "Max retries exceeded, returning HTTP error"
                        );
                        return Err(SendWithRetryError::Http(response, request_attempt));
                    }
                } else {
                    return Ok((response, request_attempt));
                }
            }
            Err(e) => {
                debug!(
                    error = %e,
                    attempt = request_attempt,
                    max_retries = retry_strategy.max_retries(),
                    "Request failed with error"
                );

                if request_attempt < retry_strategy.max_retries() {
                    retry_strategy.delay(request_attempt).await;
                    continue;
                } else {
                    error!(
                        error = %e,
                        attempts = request_attempt,
                        "Max retries exceeded, returning request error"
                    );
                    return Err(SendWithRetryError::from_request_error(e, request_attempt));
                }
            }
        }
    }
}

async fn send_request(
    client: &HttpClient,
    timeout: Duration,
    req: ddtrace_common::HttpRequestBuilder,
    payload: Bytes,
) -> Result<HttpResponse, RequestError> {
    let req = req
        .body(Body::from(payload))
        .or(Err(RequestError::Build))?;

    match tokio::time::timeout(timeout, client.request(req)).await {
        Ok(resp) => match resp {
            Ok(response) => Ok(response),
            Err(e) => Err(RequestError::Network(e)),
        },
        Err(_) => Err(RequestError::TimeoutApi),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddtrace_common::client::new_default_client;
    use httpmock::MockServer;

    fn endpoint(server: &MockServer) -> Endpoint {
        Endpoint::from_url(server.url("").parse().unwrap())
    }

    #[tokio::test]
    async fn single_attempt_error_is_final() {
        let server = MockServer::start_async().await;
        let mock_503 = server
            .mock_async(|_when, then| {
                then.status(503)
                    .header("content-type", "application/json")
                    .body(r#"{"status":"error"}"#);
            })
            .await;

        let strategy = RetryStrategy::new(1, 2, RetryBackoffType::Constant, None);
        let client = new_default_client();
        let result = send_with_retry(
            &client,
            &endpoint(&server),
            Bytes::from_static(&[0, 1, 2, 3]),
            &HashMap::new(),
            &strategy,
        )
        .await;

        assert!(
            matches!(result.unwrap_err(), SendWithRetryError::Http(_, 1)),
            "expected an http error after one attempt"
        );
        mock_503.assert_async().await;
    }

    #[tokio::test]
    async fn retries_stop_at_max() {
        let server = MockServer::start_async().await;
        let expected_attempts = 3;
        let mock_503 = server
            .mock_async(|_when, then| {
                then.status(503)
                    .header("content-type", "application/json")
                    .body(r#"{"status":"error"}"#);
            })
            .await;

        let strategy = RetryStrategy::new(expected_attempts, 10, RetryBackoffType::Constant, None);
        let client = new_default_client();
        let result = send_with_retry(
            &client,
            &endpoint(&server),
            Bytes::from_static(&[0, 1, 2, 3]),
            &HashMap::new(),
            &strategy,
        )
        .await;

        assert!(
            matches!(result.unwrap_err(), SendWithRetryError::Http(_, attempts) if attempts == expected_attempts),
            "expected an error after max attempts"
        );
        mock_503.assert_hits_async(expected_attempts as usize).await;
    }

    #[tokio::test]
    async fn success_without_retries() {
        let server = MockServer::start_async().await;
        let mock_202 = server
            .mock_async(|_when, then| {
                then.status(202)
                    .header("content-type", "application/json")
                    .body(r#"{"status":"ok"}"#);
            })
            .await;

        let strategy = RetryStrategy::new(2, 10, RetryBackoffType::Constant, None);
        let client = new_default_client();
        let result = send_with_retry(
            &client,
            &endpoint(&server),
            Bytes::from_static(&[0, 1, 2, 3]),
            &HashMap::new(),
            &strategy,
        )
        .await;

        assert!(
            matches!(result, Ok((_, attempts)) if attempts == 1),
            "expected an ok result on the first attempt"
        );
        mock_202.assert_async().await;
    }

    #[tokio::test]
    async fn headers_are_forwarded() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.header("content-type", "application/msgpack")
                    .header("x-datadog-trace-count", "7");
                then.status(200);
            })
            .await;

        let headers = HashMap::from([
            ("content-type", "application/msgpack".to_string()),
            ("x-datadog-trace-count", "7".to_string()),
        ]);
        let strategy = RetryStrategy::new(1, 10, RetryBackoffType::Constant, None);
        let client = new_default_client();
        let result = send_with_retry(
            &client,
            &endpoint(&server),
            Bytes::from_static(b"body"),
            &headers,
            &strategy,
        )
        .await;

        assert!(result.is_ok());
        mock.assert_async().await;
    }
}
