//! API error responses.
//!
//! Every failure leaving the HTTP surface is an [`ApiError`]: a status, a
//! stable machine-readable code, and a message, rendered as a JSON body.
//! Throttle and breaker rejections additionally carry the advisory headers
//! callers use for client-side backoff.

use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use relay_core::{RelayError, RequestId};

pub(crate) const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub(crate) const X_RATELIMIT_REMAINING: HeaderName =
    HeaderName::from_static("x-ratelimit-remaining");
pub(crate) const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub(crate) const X_PROXY_REQUEST_ID: HeaderName = HeaderName::from_static("x-proxy-request-id");

/// An error response ready to be rendered.
#[derive(Debug)]
pub struct ApiError {
    /// HTTP status of the response.
    pub status: StatusCode,
    /// Stable machine-readable error code.
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
    retry_after: Option<Duration>,
    quota_limit: Option<u64>,
    request_id: Option<RequestId>,
}

impl ApiError {
    fn plain(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
            quota_limit: None,
            request_id: None,
        }
    }

    /// 400 with a caller-facing explanation.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::plain(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// 404 for admin lookups that matched nothing.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::plain(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 503 for control-plane operations that cannot proceed.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::plain(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message)
    }

    /// Attaches the transaction id echoed in `X-Proxy-Request-ID`.
    #[must_use]
    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        Self {
            status: err.status_code(),
            code: err.error_code(),
            retry_after: err.retry_after(),
            quota_limit: err.quota_limit(),
            message: err.to_string(),
            request_id: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_secs = self.retry_after.map(ceil_secs);

        let mut error = serde_json::Map::new();
        error.insert("code".to_owned(), json!(self.code));
        error.insert("message".to_owned(), json!(self.message));
        if let Some(secs) = retry_secs {
            error.insert("retry_after_seconds".to_owned(), json!(secs));
        }
        let body = Json(json!({ "error": Value::Object(error) }));

        let mut response = (self.status, body).into_response();
        let headers = response.headers_mut();
        if let Some(secs) = retry_secs {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if self.status == StatusCode::TOO_MANY_REQUESTS {
            if let Some(limit) = self.quota_limit {
                headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            }
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from_static("0"));
            if let Some(secs) = retry_secs {
                headers.insert(X_RATELIMIT_RESET, HeaderValue::from(secs));
            }
        }
        if let Some(id) = &self.request_id {
            if let Ok(value) = HeaderValue::from_str(id.as_str()) {
                headers.insert(X_PROXY_REQUEST_ID, value);
            }
        }
        response
    }
}

/// Whole seconds, rounded up, never zero. A `Retry-After: 0` invites an
/// immediate retry of a request that was just rejected.
fn ceil_secs(duration: Duration) -> u64 {
    (duration.as_secs() + u64::from(duration.subsec_nanos() > 0)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    use relay_core::RouteId;

    #[test]
    fn quota_rejection_carries_rate_limit_headers() {
        let err = RelayError::rate_limited("user:alice", Duration::from_secs(42), "quota exhausted")
            .with_quota_limit(10);
        let response = ApiError::from(err).into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "42");
        assert_eq!(headers.get(X_RATELIMIT_LIMIT).unwrap(), "10");
        assert_eq!(headers.get(X_RATELIMIT_REMAINING).unwrap(), "0");
        assert_eq!(headers.get(X_RATELIMIT_RESET).unwrap(), "42");
    }

    #[test]
    fn open_breaker_maps_to_503_with_retry_hint() {
        let err = RelayError::circuit_open(RouteId::new("llm-chat"), Some(Duration::from_millis(1500)));
        let response = ApiError::from(err).into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let headers = response.headers();
        // 1.5s rounds up to the next whole second.
        assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "2");
        assert!(headers.get(X_RATELIMIT_REMAINING).is_none());
    }

    #[test]
    fn upstream_status_is_relayed_untouched() {
        let err = RelayError::upstream_error(RouteId::new("pay-charge"), StatusCode::BAD_GATEWAY);
        let api: ApiError = err.into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
        assert_eq!(api.code, "upstream_error");
    }

    #[test]
    fn request_id_is_echoed_on_errors() {
        let err = RelayError::route_not_found("GET", "/nope");
        let response = ApiError::from(err)
            .with_request_id(RequestId::new("req-123"))
            .into_response();
        assert_eq!(
            response.headers().get(X_PROXY_REQUEST_ID).unwrap(),
            "req-123"
        );
    }

    #[test]
    fn sub_second_hints_never_render_as_zero() {
        assert_eq!(ceil_secs(Duration::from_millis(80)), 1);
        assert_eq!(ceil_secs(Duration::ZERO), 1);
        assert_eq!(ceil_secs(Duration::from_secs(3)), 3);
    }
}
