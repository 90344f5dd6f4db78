//! Upstream HTTP transport.
//!
//! The pipeline talks to upstreams through [`UpstreamTransport`] so tests can
//! script outcomes without a network. The production implementation wraps a
//! pooled [`reqwest::Client`] shared across all routes; per-route deadlines
//! ride on each call rather than on the client.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use thiserror::Error;

/// One attempt against an upstream, fully assembled by the pipeline.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    /// Method, forwarded unchanged.
    pub method: Method,
    /// Absolute upstream URL including path and query.
    pub url: String,
    /// Headers after stripping and credential injection.
    pub headers: HeaderMap,
    /// Buffered request body.
    pub body: Bytes,
    /// Deadline for this attempt.
    pub timeout: Duration,
}

/// Raw upstream response before response-header sanitizing.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    /// Status as answered.
    pub status: StatusCode,
    /// Headers as answered.
    pub headers: HeaderMap,
    /// Buffered response body.
    pub body: Bytes,
}

/// Transport-level failure, classified so the retry policy and circuit
/// breaker can treat deadline misses and refused connections differently.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The attempt's deadline elapsed, during connect or mid-body.
    #[error("upstream call timed out")]
    Timeout,

    /// No connection could be established.
    #[error("upstream connect failed: {0}")]
    Connect(String),

    /// The call failed after connecting, e.g. a truncated body.
    #[error("upstream transport failure: {0}")]
    Other(String),
}

/// Sends one upstream attempt and buffers the answer.
#[async_trait]
pub trait UpstreamTransport: Send + Sync + fmt::Debug {
    /// Executes `call` within its deadline.
    async fn send(&self, call: UpstreamCall) -> Result<UpstreamReply, TransportError>;
}

/// Production transport over a shared connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds the pooled client. Compressed bodies are decoded by the
    /// client, which drops the corresponding `Content-Encoding` header.
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl UpstreamTransport for HttpTransport {
    async fn send(&self, call: UpstreamCall) -> Result<UpstreamReply, TransportError> {
        let response = self
            .client
            .request(call.method, call.url)
            .headers(call.headers)
            .body(call.body)
            .timeout(call.timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;
        Ok(UpstreamReply {
            status,
            headers,
            body,
        })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}
