//! HTTP handlers: the catch-all relay endpoint plus the control surface.

use axum::extract::{Path, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use relay_cache::{CacheStats, InvalidationEvent};
use relay_config::load_from_path;
use relay_core::{ProxyRequest, ProxyResponse, RequestId, RouteId};
use relay_resilience::{BreakerSnapshot, CircuitState};
use relay_telemetry::GatewayStats;
use relay_throttle::ThrottleStats;

use crate::error::{ApiError, X_PROXY_REQUEST_ID};
use crate::extractors::{CallerIdentity, InboundRequestId, TenantHeader};
use crate::state::AppState;

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
const X_PROXIED_BY: HeaderName = HeaderName::from_static("x-proxied-by");
const PROXIED_BY: &str = concat!("api-relay-gateway/", env!("CARGO_PKG_VERSION"));

/// The catch-all relay endpoint. Any path outside the reserved `/proxy`,
/// `/livez`, and `/readyz` surface is matched against the route table and
/// forwarded upstream.
pub async fn relay(
    State(state): State<AppState>,
    CallerIdentity(caller): CallerIdentity,
    TenantHeader(tenant): TenantHeader,
    InboundRequestId(inbound_id): InboundRequestId,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let mut request = ProxyRequest::new(method, uri.path())
        .with_headers(headers)
        .with_body(body)
        .with_caller(caller);
    if let Some(query) = uri.query() {
        request = request.with_query(query);
    }
    if let Some(tenant) = tenant {
        request = request.with_tenant(tenant);
    }
    if let Some(id) = inbound_id {
        request.id = id;
    }
    let request_id = request.id.clone();

    match state.pipeline.handle(request).await {
        Ok(outcome) => Ok(proxied_response(&request_id, outcome)),
        Err(err) => Err(ApiError::from(err).with_request_id(request_id)),
    }
}

fn proxied_response(id: &RequestId, outcome: ProxyResponse) -> Response {
    let ProxyResponse {
        status,
        mut headers,
        body,
        cache,
        ..
    } = outcome;

    headers.insert(X_CACHE, HeaderValue::from_static(cache.as_str()));
    headers.insert(X_PROXIED_BY, HeaderValue::from_static(PROXIED_BY));
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        headers.insert(X_PROXY_REQUEST_ID, value);
    }
    (status, headers, body).into_response()
}

/// Liveness probe.
pub async fn livez() -> impl IntoResponse {
    (StatusCode::OK, "alive")
}

/// Readiness probe. Not ready until at least one route is configured.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.pipeline.route_count() > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no routes configured")
    }
}

/// Health report for `GET /proxy/health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy`, or `degraded` while any circuit is open.
    pub status: &'static str,
    /// Gateway version.
    pub version: &'static str,
    /// Routes in the serving snapshot.
    pub routes: usize,
    /// Version of the active configuration snapshot.
    pub config_version: u64,
    /// One snapshot per circuit breaker.
    pub breakers: Vec<BreakerSnapshot>,
    /// Aggregate request counters.
    pub stats: GatewayStats,
}

/// Gateway health: breaker states plus the aggregate counters.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let breakers = state.pipeline.breakers().snapshots();
    let degraded = breakers
        .iter()
        .any(|snap| snap.state == CircuitState::Open || snap.forced_open);

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        version: env!("CARGO_PKG_VERSION"),
        routes: state.pipeline.route_count(),
        config_version: state.config.version(),
        breakers,
        stats: state.pipeline.stats().snapshot(),
    })
}

/// Operational counters for `GET /proxy/stats`.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    /// Version of the active configuration snapshot.
    pub config_version: u64,
    /// Request counters since startup.
    pub gateway: GatewayStats,
    /// Response cache counters.
    pub cache: CacheStats,
    /// Throttle engine internals.
    pub throttle: ThrottleStats,
    /// Usage samples dropped because the queue was full.
    pub dropped_usage_samples: u64,
    /// Invalidation events dropped because the queue was full.
    pub dropped_invalidation_events: u64,
}

/// Counters from every engine in one payload.
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        config_version: state.config.version(),
        gateway: state.pipeline.stats().snapshot(),
        cache: state.pipeline.cache().stats(),
        throttle: state.pipeline.throttle().stats(),
        dropped_usage_samples: state.pipeline.usage().dropped_samples(),
        dropped_invalidation_events: state.pipeline.invalidation().dropped_events(),
    })
}

/// Result of `POST /proxy/admin/reload`.
#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    /// Version of the snapshot that is now serving.
    pub config_version: u64,
    /// Routes in the new snapshot.
    pub routes: usize,
}

/// Re-reads the config file and swaps the serving snapshot. A file that
/// fails to parse or validate is rejected whole; the previous snapshot
/// keeps serving.
pub async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let Some(path) = &state.config_path else {
        return Err(ApiError::bad_request(
            "gateway was started without a config file, nothing to reload",
        ));
    };

    let config = load_from_path(path).await.map_err(|err| {
        warn!(error = %err, "reload rejected, config failed to load");
        ApiError::bad_request(format!("config rejected: {err}"))
    })?;
    state.pipeline.reload(config.clone()).map_err(|err| {
        warn!(error = %err, "reload rejected by pipeline");
        ApiError::bad_request(format!("config rejected: {err}"))
    })?;
    let config_version = state.config.publish(config);

    info!(config_version, "configuration reloaded via admin endpoint");
    Ok(Json(ReloadResponse {
        config_version,
        routes: state.pipeline.route_count(),
    }))
}

/// Latches the route's breaker open until force-closed.
pub async fn breaker_force_open(
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    let route = RouteId::new(route);
    if !state.pipeline.breakers().force_open(&route) {
        return Err(breaker_missing(&route));
    }
    info!(%route, "breaker forced open");
    breaker_snapshot(&state, &route)
}

/// Releases a forced-open latch and closes the breaker.
pub async fn breaker_force_close(
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    let route = RouteId::new(route);
    if !state.pipeline.breakers().force_close(&route) {
        return Err(breaker_missing(&route));
    }
    info!(%route, "breaker forced closed");
    breaker_snapshot(&state, &route)
}

/// Returns the breaker to a pristine closed state, clearing counters.
pub async fn breaker_reset(
    State(state): State<AppState>,
    Path(route): Path<String>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    let route = RouteId::new(route);
    if !state.pipeline.breakers().reset(&route) {
        return Err(breaker_missing(&route));
    }
    info!(%route, "breaker reset");
    breaker_snapshot(&state, &route)
}

fn breaker_missing(route: &RouteId) -> ApiError {
    ApiError::not_found(format!("no circuit breaker for route {route}"))
}

fn breaker_snapshot(state: &AppState, route: &RouteId) -> Result<Json<BreakerSnapshot>, ApiError> {
    state
        .pipeline
        .breakers()
        .breaker(route)
        .map(|breaker| Json(breaker.snapshot()))
        .ok_or_else(|| breaker_missing(route))
}

/// Body of `POST /proxy/admin/cache/invalidate`.
#[derive(Debug, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum InvalidateRequest {
    /// Remove one entry by its exact cache key.
    Key {
        /// Hex cache key as produced by the gateway.
        key: String,
    },
    /// Remove entries whose request path matches a glob pattern.
    Pattern {
        /// Glob with `*` and `**` wildcards, e.g. `/v1/models*`.
        pattern: String,
    },
    /// Remove entries carrying a tag.
    Tag {
        /// Tag value, e.g. `upstream:openai`.
        tag: String,
    },
    /// Remove every entry stored for a route.
    Route {
        /// Route identifier.
        route: String,
    },
    /// Flush the whole cache.
    All,
}

/// Result of an admin invalidation.
#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    /// Entries removed.
    pub removed: usize,
}

/// Body of `POST /proxy/admin/events`.
#[derive(Debug, Deserialize)]
pub struct EventRequest {
    /// Event kind matched against rule triggers, e.g. `credential.rotated`.
    pub kind: String,
    /// Resource identifier substituted into rule templates.
    #[serde(default)]
    pub resource: Option<String>,
}

/// Receipt for a queued invalidation event.
#[derive(Debug, Serialize)]
pub struct EventResponse {
    /// False when the queue was full and the event was dropped.
    pub accepted: bool,
}

/// Direct cache invalidation, bypassing the event queue.
pub async fn cache_invalidate(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let cache = state.pipeline.cache();
    let removed = match request {
        InvalidateRequest::Key { key } => cache.invalidate_key(&key),
        InvalidateRequest::Pattern { pattern } => cache
            .invalidate_pattern(&pattern)
            .map_err(|err| ApiError::bad_request(err.to_string()))?,
        InvalidateRequest::Tag { tag } => cache.invalidate_tag(&tag),
        InvalidateRequest::Route { route } => cache.invalidate_route(&RouteId::new(route)),
        InvalidateRequest::All => cache.invalidate_all(),
    };
    info!(removed, "cache invalidated via admin endpoint");
    Ok(Json(InvalidateResponse { removed }))
}

/// Queues an invalidation event from an external trigger, e.g. a
/// credential rotation hook or an upstream deploy webhook. The worker
/// applies matching rules asynchronously.
pub async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<EventRequest>,
) -> (StatusCode, Json<EventResponse>) {
    let mut event = InvalidationEvent::new(request.kind);
    if let Some(resource) = request.resource {
        event = event.with_resource(resource);
    }
    let accepted = state.pipeline.invalidation().publish(event);
    let status = if accepted {
        StatusCode::ACCEPTED
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(EventResponse { accepted }))
}

#[cfg(test)]
mod tests {
    use super::*;

    use relay_core::CacheStatus;

    #[test]
    fn invalidate_request_parses_each_scope() {
        let key: InvalidateRequest =
            serde_json::from_str(r#"{"scope":"key","key":"abc123"}"#).unwrap();
        assert!(matches!(key, InvalidateRequest::Key { key } if key == "abc123"));

        let all: InvalidateRequest = serde_json::from_str(r#"{"scope":"all"}"#).unwrap();
        assert!(matches!(all, InvalidateRequest::All));

        let tag: InvalidateRequest =
            serde_json::from_str(r#"{"scope":"tag","tag":"upstream:openai"}"#).unwrap();
        assert!(matches!(tag, InvalidateRequest::Tag { tag } if tag == "upstream:openai"));
    }

    #[test]
    fn proxied_response_carries_gateway_headers() {
        let outcome = ProxyResponse::cached(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::from_static(b"{}"),
        );
        assert_eq!(outcome.cache, CacheStatus::Hit);

        let response = proxied_response(&RequestId::new("req-1"), outcome);
        let headers = response.headers();
        assert_eq!(headers.get(X_CACHE).unwrap(), "HIT");
        assert_eq!(headers.get(X_PROXY_REQUEST_ID).unwrap(), "req-1");
        assert!(headers
            .get(X_PROXIED_BY)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("api-relay-gateway/"));
    }
}
