//! The gateway-internal representation of a proxied request.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};

use crate::ids::{CallerId, RequestId, TenantId};

/// A request accepted at the relay surface, decoupled from any particular
/// HTTP framework so the pipeline and its tests can construct one directly.
///
/// The body is fully buffered: response caching and idempotent retries both
/// need to replay it, so streaming pass-through is intentionally not
/// supported at this layer.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    /// Correlation id for this transaction.
    pub id: RequestId,
    /// HTTP method as received.
    pub method: Method,
    /// Request path, always beginning with `/`.
    pub path: String,
    /// Raw query string without the leading `?`, if any.
    pub query: Option<String>,
    /// Headers as received. Hop-by-hop headers are stripped before the
    /// upstream call, not here.
    pub headers: HeaderMap,
    /// Fully buffered request body.
    pub body: Bytes,
    /// Caller identity resolved at ingress.
    pub caller: CallerId,
    /// Tenant the caller belongs to, when known.
    pub tenant: Option<TenantId>,
    /// Wall-clock arrival time, used for logging and usage samples.
    pub received_at: DateTime<Utc>,
}

impl ProxyRequest {
    /// Creates a request with a generated id, an anonymous caller, and an
    /// empty body. Builder-style methods fill in the rest.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: RequestId::generate(),
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            caller: CallerId::anonymous(),
            tenant: None,
            received_at: Utc::now(),
        }
    }

    /// Sets the raw query string.
    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Replaces the header map.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the buffered body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Sets the caller identity.
    #[must_use]
    pub fn with_caller(mut self, caller: CallerId) -> Self {
        self.caller = caller;
        self
    }

    /// Sets the tenant.
    #[must_use]
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    /// Sets an explicit request id, replacing the generated one.
    #[must_use]
    pub fn with_id(mut self, id: RequestId) -> Self {
        self.id = id;
        self
    }

    /// Whether the method is safe to retry after a transient upstream
    /// failure. Mirrors RFC 9110 idempotent methods.
    #[must_use]
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE
        )
    }

    /// Path and query joined back together, as sent to the upstream.
    #[must_use]
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(q) if !q.is_empty() => format!("{}?{}", self.path, q),
            _ => self.path.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let req = ProxyRequest::new(Method::GET, "/v1/chat")
            .with_query("stream=false")
            .with_caller(CallerId::new("svc-a"));
        assert_eq!(req.path_and_query(), "/v1/chat?stream=false");
        assert_eq!(req.caller.as_str(), "svc-a");
        assert!(req.tenant.is_none());
        assert!(req.body.is_empty());
    }

    #[test]
    fn idempotency_follows_method() {
        assert!(ProxyRequest::new(Method::GET, "/a").is_idempotent());
        assert!(ProxyRequest::new(Method::PUT, "/a").is_idempotent());
        assert!(ProxyRequest::new(Method::DELETE, "/a").is_idempotent());
        assert!(!ProxyRequest::new(Method::POST, "/a").is_idempotent());
        assert!(!ProxyRequest::new(Method::PATCH, "/a").is_idempotent());
    }

    #[test]
    fn empty_query_is_omitted() {
        let req = ProxyRequest::new(Method::GET, "/v1/ocr").with_query("");
        assert_eq!(req.path_and_query(), "/v1/ocr");
    }
}
