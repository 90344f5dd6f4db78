//! Router assembly.
//!
//! The relay surface is the fallback: every path outside `/livez`,
//! `/readyz`, and `/proxy/*` is matched against the route table and
//! forwarded. The control surface lives under `/proxy` so it can never
//! collide with an upstream path.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use relay_config::ServerSettings;

use crate::handlers;
use crate::state::AppState;

/// Builds the full gateway router.
pub fn router(state: AppState, settings: &ServerSettings) -> Router {
    let admin = Router::new()
        .route("/reload", post(handlers::reload))
        .route("/events", post(handlers::publish_event))
        .route("/cache/invalidate", post(handlers::cache_invalidate))
        .route(
            "/breakers/:route/force-open",
            post(handlers::breaker_force_open),
        )
        .route(
            "/breakers/:route/force-close",
            post(handlers::breaker_force_close),
        )
        .route("/breakers/:route/reset", post(handlers::breaker_reset));

    let control = Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        .nest("/admin", admin);

    Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .nest("/proxy", control)
        .fallback(handlers::relay)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(settings.max_body_bytes))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
    use bytes::Bytes;
    use serde_json::Value;
    use tower::ServiceExt;

    use relay_cache::CachedResponse;
    use relay_config::{ConfigHandle, GatewayConfig};
    use relay_core::RouteId;
    use relay_pipeline::{
        LogUsageSink, Pipeline, TransportError, UpstreamCall, UpstreamReply, UpstreamTransport,
    };
    use relay_throttle::NullMetricsFeed;

    #[derive(Debug, Default)]
    struct StaticTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamTransport for StaticTransport {
        async fn send(&self, _call: UpstreamCall) -> Result<UpstreamReply, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            Ok(UpstreamReply {
                status: StatusCode::OK,
                headers,
                body: Bytes::from_static(b"{\"object\":\"list\"}"),
            })
        }
    }

    fn state_with(yaml: &str) -> AppState {
        let config: GatewayConfig = serde_yaml::from_str(yaml).unwrap();
        let (pipeline, _workers) = Pipeline::new(
            config.clone(),
            Arc::new(StaticTransport::default()),
            Arc::new(NullMetricsFeed),
            Arc::new(LogUsageSink),
        )
        .unwrap();
        AppState::new(Arc::new(pipeline), Arc::new(ConfigHandle::new(config)), None)
    }

    fn app(yaml: &str) -> Router {
        router(state_with(yaml), &ServerSettings::default())
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const MODELS_ROUTE: &str = r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: https://llm.internal
";

    #[tokio::test]
    async fn liveness_always_answers() {
        let response = app("routes: []")
            .oneshot(get_request("/livez"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_requires_routes() {
        let response = app("routes: []")
            .oneshot(get_request("/readyz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app(MODELS_ROUTE)
            .oneshot(get_request("/readyz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_breakers_and_counters() {
        let response = app(MODELS_ROUTE)
            .oneshot(get_request("/proxy/health"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["routes"], 1);
        assert_eq!(body["breakers"][0]["route"], "models");
        assert_eq!(body["breakers"][0]["state"], "closed");
    }

    #[tokio::test]
    async fn relayed_responses_carry_gateway_headers() {
        let app = app(
            r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: https://llm.internal
    cache:
      enabled: true
      ttl: 60s
",
        );

        let first = app.clone().oneshot(get_request("/v1/models")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers().get("x-cache").unwrap(), "MISS");
        assert!(first.headers().contains_key("x-proxy-request-id"));
        assert!(first
            .headers()
            .get("x-proxied-by")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("api-relay-gateway/"));

        let second = app.oneshot(get_request("/v1/models")).await.unwrap();
        assert_eq!(second.headers().get("x-cache").unwrap(), "HIT");
    }

    #[tokio::test]
    async fn inbound_request_id_round_trips() {
        let request = Request::builder()
            .uri("/v1/models")
            .header("x-request-id", "req-42")
            .body(Body::empty())
            .unwrap();
        let response = app(MODELS_ROUTE).oneshot(request).await.unwrap();

        assert_eq!(
            response.headers().get("x-proxy-request-id").unwrap(),
            "req-42"
        );
    }

    #[tokio::test]
    async fn unmatched_paths_return_structured_not_found() {
        let response = app(MODELS_ROUTE)
            .oneshot(get_request("/v2/unknown"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "route_not_found");
    }

    #[tokio::test]
    async fn quota_exhaustion_surfaces_retry_after() {
        let app = app(
            r"
routes:
  - id: charges
    pattern: /v1/charges
    upstream_base_url: https://pay.internal
    rate_limits:
      - scope: user
        limit: 1
        window: 60s
",
        );

        let first = app.clone().oneshot(get_request("/v1/charges")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(get_request("/v1/charges")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.headers().get("x-ratelimit-limit").unwrap(), "1");
        assert_eq!(second.headers().get("x-ratelimit-remaining").unwrap(), "0");
        let retry_after: u64 = second
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=60).contains(&retry_after));
    }

    #[tokio::test]
    async fn admin_invalidates_cache_by_tag() {
        let state = state_with(MODELS_ROUTE);
        let cache = state.pipeline.cache();
        let stored = CachedResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
        };
        cache.store(
            "key-a",
            &RouteId::new("models"),
            "/v1/models",
            stored.clone(),
            Duration::from_secs(60),
            &["upstream:openai".to_string()],
        );
        cache.store(
            "key-b",
            &RouteId::new("models"),
            "/v1/models",
            stored,
            Duration::from_secs(60),
            &["upstream:anthropic".to_string()],
        );

        let request = Request::builder()
            .method("POST")
            .uri("/proxy/admin/cache/invalidate")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"scope":"tag","tag":"upstream:openai"}"#))
            .unwrap();
        let response = router(state.clone(), &ServerSettings::default())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["removed"], 1);
        assert_eq!(state.pipeline.cache().len(), 1);
    }

    #[tokio::test]
    async fn breaker_admin_on_unknown_route_is_not_found() {
        let request = Request::builder()
            .method("POST")
            .uri("/proxy/admin/breakers/ghost/force-open")
            .body(Body::empty())
            .unwrap();
        let response = app(MODELS_ROUTE).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn forced_open_breaker_rejects_relayed_calls() {
        let app = app(MODELS_ROUTE);
        let force_open = Request::builder()
            .method("POST")
            .uri("/proxy/admin/breakers/models/force-open")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(force_open).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["forced_open"], true);

        let rejected = app.clone().oneshot(get_request("/v1/models")).await.unwrap();
        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(rejected).await;
        assert_eq!(body["error"]["code"], "circuit_open");

        let force_close = Request::builder()
            .method("POST")
            .uri("/proxy/admin/breakers/models/force-close")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(force_close).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let served = app.oneshot(get_request("/v1/models")).await.unwrap();
        assert_eq!(served.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reload_without_config_file_is_rejected() {
        let request = Request::builder()
            .method("POST")
            .uri("/proxy/admin/reload")
            .body(Body::empty())
            .unwrap();
        let response = app(MODELS_ROUTE).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
