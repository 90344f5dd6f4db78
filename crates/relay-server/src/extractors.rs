//! Axum extractors for the relay surface.
//!
//! Internal callers identify themselves with plain headers; the gateway
//! trusts them because it only listens inside the service mesh. Nothing
//! here rejects a request: absent identity degrades to the anonymous
//! caller, which still participates in throttling and usage accounting.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use relay_core::{CallerId, RequestId, TenantId};

use crate::error::ApiError;

/// Caller identity from the `X-Caller-ID` header.
#[derive(Debug, Clone)]
pub struct CallerIdentity(pub CallerId);

#[async_trait]
impl<S> FromRequestParts<S> for CallerIdentity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let caller = parts
            .headers
            .get("x-caller-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map_or_else(CallerId::anonymous, CallerId::new);
        Ok(Self(caller))
    }
}

/// Tenant from the `X-Tenant-ID` header, when present.
#[derive(Debug, Clone)]
pub struct TenantHeader(pub Option<TenantId>);

#[async_trait]
impl<S> FromRequestParts<S> for TenantHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = parts
            .headers
            .get("x-tenant-id")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(TenantId::new);
        Ok(Self(tenant))
    }
}

/// Transaction id supplied by the caller via `X-Request-ID` or
/// `X-Correlation-ID`. `None` means the gateway generates one.
#[derive(Debug, Clone)]
pub struct InboundRequestId(pub Option<RequestId>);

#[async_trait]
impl<S> FromRequestParts<S> for InboundRequestId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get("x-request-id")
            .or_else(|| parts.headers.get("x-correlation-id"))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(RequestId::new);
        Ok(Self(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::http::Request;

    fn parts_for(builder: axum::http::request::Builder) -> Parts {
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        parts
    }

    #[tokio::test]
    async fn caller_header_is_honored() {
        let mut parts = parts_for(Request::builder().header("x-caller-id", "svc-billing"));
        let CallerIdentity(caller) = CallerIdentity::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(caller.as_str(), "svc-billing");
    }

    #[tokio::test]
    async fn missing_or_blank_caller_degrades_to_anonymous() {
        let mut parts = parts_for(Request::builder());
        let CallerIdentity(caller) = CallerIdentity::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(caller, CallerId::anonymous());

        let mut parts = parts_for(Request::builder().header("x-caller-id", "   "));
        let CallerIdentity(caller) = CallerIdentity::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(caller, CallerId::anonymous());
    }

    #[tokio::test]
    async fn tenant_is_optional() {
        let mut parts = parts_for(Request::builder().header("x-tenant-id", "acme"));
        let TenantHeader(tenant) = TenantHeader::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(tenant, Some(TenantId::new("acme")));

        let mut parts = parts_for(Request::builder());
        let TenantHeader(tenant) = TenantHeader::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert!(tenant.is_none());
    }

    #[tokio::test]
    async fn correlation_id_is_a_fallback_for_request_id() {
        let mut parts = parts_for(
            Request::builder()
                .header("x-correlation-id", "corr-7")
                .header("x-request-id", "req-9"),
        );
        let InboundRequestId(id) = InboundRequestId::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(id, Some(RequestId::new("req-9")));

        let mut parts = parts_for(Request::builder().header("x-correlation-id", "corr-7"));
        let InboundRequestId(id) = InboundRequestId::from_request_parts(&mut parts, &())
            .await
            .unwrap();
        assert_eq!(id, Some(RequestId::new("corr-7")));
    }
}
