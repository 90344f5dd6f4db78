//! Control-plane operations: hot reload and breaker administration.

use pretty_assertions::assert_eq;
use wiremock::MockServer;

use crate::helpers::{TempConfigFile, TestGateway};
use crate::upstream::{mock_upstream, mount_failing_then_ok, mount_ok};

fn routes_yaml(upstream: &MockServer, extra_routes: &str) -> String {
    format!(
        r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: {}
{extra_routes}",
        upstream.uri()
    )
}

#[tokio::test]
async fn reload_swaps_routes_without_restarting() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;
    mount_ok(&upstream, "GET", "/v1/embeddings", "embeddings").await;

    let file = TempConfigFile::new();
    let gateway = TestGateway::start_with_file(&routes_yaml(&upstream, ""), file.path.clone()).await;

    let response = gateway.get("/v1/embeddings").await;
    assert_eq!(response.status().as_u16(), 404);

    let extra = format!(
        r"  - id: embeddings
    pattern: /v1/embeddings
    upstream_base_url: {}
",
        upstream.uri()
    );
    file.rewrite(&routes_yaml(&upstream, &extra));

    let response = gateway.post_empty("/proxy/admin/reload").await;
    assert_eq!(response.status().as_u16(), 200);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["routes"], 2);
    assert_eq!(body["config_version"], 2);

    // The new route serves immediately; the old one keeps working.
    let response = gateway.get("/v1/embeddings").await;
    assert_eq!(response.status().as_u16(), 200);
    let response = gateway.get("/v1/models").await;
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn malformed_reload_keeps_the_running_config() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;

    let file = TempConfigFile::new();
    let gateway = TestGateway::start_with_file(&routes_yaml(&upstream, ""), file.path.clone()).await;

    file.rewrite("routes: [this is not\n");

    let response = gateway.post_empty("/proxy/admin/reload").await;
    assert_eq!(response.status().as_u16(), 400);

    let stats = gateway.stats().await;
    assert_eq!(stats["config_version"], 1);
    let response = gateway.get("/v1/models").await;
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn breaker_reset_clears_accumulated_failures() {
    let upstream = mock_upstream().await;
    mount_failing_then_ok(&upstream, "/v1/models", 500, 2).await;

    let gateway = TestGateway::start(&format!(
        r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: {}
    max_retries: 0
    breaker:
      failure_threshold: 5
",
        upstream.uri()
    ))
    .await;

    for _ in 0..2 {
        let response = gateway.get("/v1/models").await;
        assert_eq!(response.status().as_u16(), 500);
    }

    let health = TestGateway::json_body(gateway.get("/proxy/health").await).await;
    assert_eq!(health["breakers"][0]["consecutive_failures"], 2);

    let response = gateway.post_empty("/proxy/admin/breakers/models/reset").await;
    assert_eq!(response.status().as_u16(), 200);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["consecutive_failures"], 0);
    assert_eq!(body["state"], "closed");

    let health = TestGateway::json_body(gateway.get("/proxy/health").await).await;
    assert_eq!(health["breakers"][0]["consecutive_failures"], 0);
}

#[tokio::test]
async fn stats_surface_the_control_plane_counters() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;

    let gateway = TestGateway::start(&routes_yaml(&upstream, "")).await;
    for _ in 0..3 {
        gateway.get("/v1/models").await;
    }

    let stats = gateway.stats().await;
    assert_eq!(stats["config_version"], 1);
    assert_eq!(stats["gateway"]["total_requests"], 3);
    assert_eq!(stats["gateway"]["relayed"], 3);
    assert_eq!(stats["dropped_usage_samples"], 0);
    assert_eq!(stats["dropped_invalidation_events"], 0);
    assert_eq!(stats["gateway"]["routes"]["models"]["requests"], 3);
}
