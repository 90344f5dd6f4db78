//! Error taxonomy for the relay pipeline.
//!
//! Every failure surfaced to a caller is one of the variants below, so the
//! HTTP layer can map errors to status codes and headers without inspecting
//! message strings. Cache and logging failures are deliberately absent: they
//! are degraded-mode conditions handled in place, never surfaced as request
//! failures.

use std::time::Duration;

use http::StatusCode;

use crate::ids::RouteId;
use crate::usage::FailureClass;

/// Result alias used throughout the relay crates.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors produced while forwarding a request through the relay pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No configured route matched the request path and method.
    #[error("no route matches {method} {path}")]
    RouteNotFound {
        /// HTTP method of the rejected request.
        method: String,
        /// Request path that failed to match.
        path: String,
    },

    /// The admission layer rejected the request.
    #[error("rate limited on {scope}: {reason}")]
    RateLimited {
        /// Scope that triggered the rejection, e.g. `user:alice`.
        scope: String,
        /// Suggested delay before the caller retries.
        retry_after: Duration,
        /// Human-readable rejection reason.
        reason: String,
        /// Window limit of the exhausted quota, when a quota (rather than
        /// probabilistic shedding) caused the rejection.
        limit: Option<u64>,
    },

    /// The route's circuit breaker is open and the call was short-circuited.
    #[error("circuit open for route {route}")]
    CircuitOpen {
        /// Route whose breaker rejected the call.
        route: RouteId,
        /// Time until the next recovery probe is permitted, if known.
        retry_after: Option<Duration>,
    },

    /// The upstream did not answer within the route's deadline.
    #[error("upstream timed out for route {route} after {timeout:?}")]
    UpstreamTimeout {
        /// Route whose upstream timed out.
        route: RouteId,
        /// Deadline that was exceeded.
        timeout: Duration,
    },

    /// The upstream kept answering with server errors until retries ran out.
    ///
    /// The upstream status is relayed to the caller; the response body is
    /// replaced by the gateway error envelope carrying the request id.
    #[error("upstream returned {status} for route {route}")]
    UpstreamError {
        /// Route whose upstream misbehaved.
        route: RouteId,
        /// Final upstream status observed.
        status: StatusCode,
    },

    /// The upstream failed at the transport level without a relayable response.
    #[error("upstream call failed for route {route}: {detail}")]
    UpstreamUnavailable {
        /// Route whose upstream failed.
        route: RouteId,
        /// Transport-level failure description.
        detail: String,
    },

    /// No healthy credential is available for the upstream.
    #[error("no healthy credential for route {route}")]
    NoHealthyCredential {
        /// Route that could not be authenticated against its upstream.
        route: RouteId,
    },

    /// An internal pipeline stage failed in a way that is not the caller's
    /// or the upstream's fault.
    #[error("internal pipeline error: {message}")]
    Internal {
        /// Description of the internal failure.
        message: String,
    },
}

impl RelayError {
    /// Convenience constructor for [`RelayError::RouteNotFound`].
    #[must_use]
    pub fn route_not_found(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self::RouteNotFound {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Convenience constructor for [`RelayError::RateLimited`].
    #[must_use]
    pub fn rate_limited(
        scope: impl Into<String>,
        retry_after: Duration,
        reason: impl Into<String>,
    ) -> Self {
        Self::RateLimited {
            scope: scope.into(),
            retry_after,
            reason: reason.into(),
            limit: None,
        }
    }

    /// Attaches the exhausted quota's window limit to a
    /// [`RelayError::RateLimited`]; no-op on other variants.
    #[must_use]
    pub fn with_quota_limit(mut self, quota_limit: u64) -> Self {
        if let Self::RateLimited { limit, .. } = &mut self {
            *limit = Some(quota_limit);
        }
        self
    }

    /// Window limit of the exhausted quota behind a rate-limit rejection.
    #[must_use]
    pub fn quota_limit(&self) -> Option<u64> {
        match self {
            Self::RateLimited { limit, .. } => *limit,
            _ => None,
        }
    }

    /// Convenience constructor for [`RelayError::CircuitOpen`].
    #[must_use]
    pub fn circuit_open(route: RouteId, retry_after: Option<Duration>) -> Self {
        Self::CircuitOpen { route, retry_after }
    }

    /// Convenience constructor for [`RelayError::UpstreamTimeout`].
    #[must_use]
    pub fn upstream_timeout(route: RouteId, timeout: Duration) -> Self {
        Self::UpstreamTimeout { route, timeout }
    }

    /// Convenience constructor for [`RelayError::UpstreamError`].
    #[must_use]
    pub fn upstream_error(route: RouteId, status: StatusCode) -> Self {
        Self::UpstreamError { route, status }
    }

    /// Convenience constructor for [`RelayError::UpstreamUnavailable`].
    #[must_use]
    pub fn upstream_unavailable(route: RouteId, detail: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            route,
            detail: detail.into(),
        }
    }

    /// Convenience constructor for [`RelayError::NoHealthyCredential`].
    #[must_use]
    pub fn no_healthy_credential(route: RouteId) -> Self {
        Self::NoHealthyCredential { route }
    }

    /// Convenience constructor for [`RelayError::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code this error maps to at the gateway surface.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::CircuitOpen { .. } | Self::NoHealthyCredential { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamError { status, .. } => *status,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code for response bodies and logs.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "route_not_found",
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::UpstreamUnavailable { .. } => "upstream_unavailable",
            Self::NoHealthyCredential { .. } => "no_healthy_credential",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Delay the caller should wait before retrying, when one applies.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Failure class recorded against the route's circuit breaker, if this
    /// error reflects upstream health at all.
    #[must_use]
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::UpstreamTimeout { .. } => Some(FailureClass::Timeout),
            Self::UpstreamError { .. } => Some(FailureClass::ServerError),
            Self::UpstreamUnavailable { .. } => Some(FailureClass::Connect),
            Self::Internal { .. } => Some(FailureClass::Internal),
            _ => None,
        }
    }
}
