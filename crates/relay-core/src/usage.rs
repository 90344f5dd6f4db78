//! Usage samples emitted after every proxied transaction.
//!
//! Samples feed the circuit breakers, the adaptive throttler's bookkeeping,
//! and the external usage sink. They are produced on the request path but
//! consumed asynchronously, so the struct is cheap to move across a channel.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids::{CallerId, RequestId, RouteId, TenantId};

/// Coarse classification of an upstream failure.
///
/// The circuit breaker counts these against a route's health; the retry
/// policy consults [`FailureClass::is_retryable`] before re-attempting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The route deadline elapsed before the upstream answered.
    Timeout,
    /// Connection-level failure before any response arrived.
    Connect,
    /// The upstream answered with a 5xx status.
    ServerError,
    /// A relay-internal stage failed.
    Internal,
}

impl FailureClass {
    /// Whether another attempt against the same upstream is worthwhile.
    ///
    /// Client errors never reach this type at all: a 4xx means the upstream
    /// is healthy and the request itself was bad, so it is neither retried
    /// nor counted as a failure.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Connect | Self::ServerError)
    }
}

/// One record of a completed (or failed) proxied transaction.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSample {
    /// Transaction correlation id.
    pub request_id: RequestId,
    /// Route that handled the request, when one matched.
    pub route: RouteId,
    /// Caller identity.
    pub caller: CallerId,
    /// Tenant, when known.
    pub tenant: Option<TenantId>,
    /// Whether the transaction succeeded from the caller's point of view.
    pub success: bool,
    /// Final status relayed to the caller, when a response was produced.
    pub status: Option<u16>,
    /// Failure classification for unsuccessful transactions.
    pub failure: Option<FailureClass>,
    /// End-to-end latency inside the gateway.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// Whether the response came from the cache.
    pub cache_hit: bool,
    /// Completion time.
    pub at: DateTime<Utc>,
}

impl UsageSample {
    /// Creates a successful sample.
    #[must_use]
    pub fn success(
        request_id: RequestId,
        route: RouteId,
        caller: CallerId,
        status: u16,
        latency: Duration,
        cache_hit: bool,
    ) -> Self {
        Self {
            request_id,
            route,
            caller,
            tenant: None,
            success: true,
            status: Some(status),
            failure: None,
            latency,
            cache_hit,
            at: Utc::now(),
        }
    }

    /// Creates a failed sample.
    #[must_use]
    pub fn failure(
        request_id: RequestId,
        route: RouteId,
        caller: CallerId,
        class: FailureClass,
        status: Option<u16>,
        latency: Duration,
    ) -> Self {
        Self {
            request_id,
            route,
            caller,
            tenant: None,
            success: false,
            status,
            failure: Some(class),
            latency,
            cache_hit: false,
            at: Utc::now(),
        }
    }

    /// Attaches the tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: Option<TenantId>) -> Self {
        self.tenant = tenant;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(FailureClass::Timeout.is_retryable());
        assert!(FailureClass::Connect.is_retryable());
        assert!(FailureClass::ServerError.is_retryable());
        assert!(!FailureClass::Internal.is_retryable());
    }

    #[test]
    fn failure_sample_carries_class() {
        let sample = UsageSample::failure(
            RequestId::generate(),
            RouteId::new("pay"),
            CallerId::new("svc-checkout"),
            FailureClass::Timeout,
            None,
            Duration::from_millis(2500),
        );
        assert!(!sample.success);
        assert_eq!(sample.failure, Some(FailureClass::Timeout));
        assert!(!sample.cache_hit);
    }

    #[test]
    fn sample_serializes_for_the_sink() {
        let sample = UsageSample::success(
            RequestId::new("req-1"),
            RouteId::new("llm"),
            CallerId::new("svc-a"),
            200,
            Duration::from_millis(120),
            true,
        );
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["route"], "llm");
        assert_eq!(json["cache_hit"], true);
        assert_eq!(json["status"], 200);
    }
}
