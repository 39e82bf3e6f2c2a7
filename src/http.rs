// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # HTTP Dispatcher
//!
//! Sends converted events to the configured sink, retrying transport failures
//! and (optionally) server-side error responses on the send retry policy.

use crate::{
    errors::AdapterError,
    retry::{RetryPolicy, Sleeper, TokioSleeper},
};
use reqwest::{header::HeaderMap, Method, StatusCode};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Default per-request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Request produced from a delivery, sent as-is on every attempt.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Final answer from the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
}

impl SinkResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Owns the HTTP client and the sink target. Stateless per call.
pub struct HttpDispatcher {
    client: reqwest::Client,
    target: String,
    sleeper: Arc<dyn Sleeper>,
    retry_on_server_error: bool,
}

impl HttpDispatcher {
    /// Creates a dispatcher posting to `target`.
    ///
    /// # Parameters
    /// * `target` - Sink URI every request is sent to
    /// * `timeout` - Per-attempt request timeout
    ///
    /// # Returns
    /// The dispatcher, or `ConfigurationError` when the HTTP client cannot be built
    pub fn new(target: &str, timeout: Duration) -> Result<HttpDispatcher, AdapterError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| {
                AdapterError::ConfigurationError(format!("failed to build HTTP client: {}", err))
            })?;

        Ok(HttpDispatcher {
            client,
            target: target.to_owned(),
            sleeper: Arc::new(TokioSleeper),
            retry_on_server_error: true,
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Whether 5xx and 429 answers are retried like transport failures.
    pub fn retry_on_server_error(mut self, enabled: bool) -> Self {
        self.retry_on_server_error = enabled;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Sends `request` to the sink, making up to `policy.attempts()` tries.
    ///
    /// Transport failures are always retried; 5xx (except 501) and 429
    /// answers are retried while `retry_on_server_error` is enabled.
    ///
    /// # Parameters
    /// * `request` - Method, headers and body to send on every attempt
    /// * `policy` - Attempt budget and backoff between attempts
    ///
    /// # Returns
    /// The last response even when it is not a 2xx, or `SendError` when the
    /// final attempt failed in transport
    pub async fn send(
        &self,
        request: &OutboundRequest,
        policy: &RetryPolicy,
    ) -> Result<SinkResponse, AdapterError> {
        let attempts = policy.attempts();
        let mut attempt = 1;

        loop {
            let result = self
                .client
                .request(request.method.clone(), &self.target)
                .headers(request.headers.clone())
                .body(request.body.clone())
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if attempt >= attempts || !self.is_retryable(status) {
                        debug!(status = status.as_u16(), attempt, "sink responded");
                        return Ok(SinkResponse {
                            status: status.as_u16(),
                        });
                    }
                    warn!(status = status.as_u16(), attempt, "sink responded with retryable status");
                }
                Err(err) => {
                    if attempt >= attempts {
                        error!(error = err.to_string(), attempt, "error while sending the message");
                        return Err(AdapterError::SendError(err.to_string()));
                    }
                    warn!(error = err.to_string(), attempt, "transport failure, retrying");
                }
            }

            self.sleeper.sleep(policy.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    fn is_retryable(&self, status: StatusCode) -> bool {
        self.retry_on_server_error
            && (status == StatusCode::TOO_MANY_REQUESTS
                || (status.is_server_error() && status != StatusCode::NOT_IMPLEMENTED))
    }
}
