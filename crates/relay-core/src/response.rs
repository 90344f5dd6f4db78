//! The gateway-internal representation of a relayed response.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

/// Whether a response was served from the response cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Served from cache without touching the upstream.
    Hit,
    /// Fetched from the upstream; may have been stored afterwards.
    Miss,
    /// Caching does not apply to this route or method.
    Bypass,
}

impl CacheStatus {
    /// Value placed in the `X-Cache` response header.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "HIT",
            Self::Miss => "MISS",
            Self::Bypass => "BYPASS",
        }
    }
}

/// A response produced by the pipeline, either relayed from an upstream or
/// replayed from the cache.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    /// Status relayed to the caller.
    pub status: StatusCode,
    /// Response headers after hop-by-hop stripping.
    pub headers: HeaderMap,
    /// Fully buffered response body.
    pub body: Bytes,
    /// Cache disposition, surfaced in `X-Cache`.
    pub cache: CacheStatus,
    /// Time spent waiting on the upstream, absent for cache hits.
    pub upstream_latency: Option<Duration>,
}

impl ProxyResponse {
    /// Creates a response relayed from an upstream call.
    #[must_use]
    pub fn upstream(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        latency: Duration,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            cache: CacheStatus::Miss,
            upstream_latency: Some(latency),
        }
    }

    /// Creates a response replayed from the cache.
    #[must_use]
    pub fn cached(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            cache: CacheStatus::Hit,
            upstream_latency: None,
        }
    }

    /// Marks the response as exempt from caching.
    #[must_use]
    pub fn bypass(mut self) -> Self {
        self.cache = CacheStatus::Bypass;
        self
    }

    /// Whether the upstream reported success (2xx or 3xx).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success() || self.status.is_redirection()
    }
}
