//! Response cache behavior through the relay and admin surfaces.

use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::MockServer;

use crate::helpers::{wait_for, TestGateway};
use crate::upstream::{mock_upstream, mount_ok, upstream_hits};

fn cached_route(upstream: &MockServer, cache_yaml: &str) -> String {
    format!(
        r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: {}
    cache:
{cache_yaml}",
        upstream.uri()
    )
}

#[tokio::test]
async fn repeat_lookups_hit_until_ttl_expiry() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;

    let gateway = TestGateway::start(&cached_route(
        &upstream,
        "      enabled: true\n      ttl: 1s\n",
    ))
    .await;

    let response = gateway.get("/v1/models").await;
    assert_eq!(response.headers()["x-cache"], "MISS");

    let response = gateway.get("/v1/models").await;
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(upstream_hits(&upstream).await, 1);

    let stats = gateway.stats().await;
    assert_eq!(stats["gateway"]["cache_hits"], 1);
    assert_eq!(stats["cache"]["entries"], 1);

    // Past the TTL the entry is stale and the lookup goes upstream again.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let response = gateway.get("/v1/models").await;
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(upstream_hits(&upstream).await, 2);
}

#[tokio::test]
async fn vary_headers_partition_entries() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;

    let gateway = TestGateway::start(&cached_route(
        &upstream,
        r"      enabled: true
      ttl: 60s
      vary_headers: [x-api-version]
",
    ))
    .await;

    let v1 = [("x-api-version", "2024-01")];
    let v2 = [("x-api-version", "2024-06")];

    let response = gateway.get_with_headers("/v1/models", &v1).await;
    assert_eq!(response.headers()["x-cache"], "MISS");

    // A different vary value is a different entry.
    let response = gateway.get_with_headers("/v1/models", &v2).await;
    assert_eq!(response.headers()["x-cache"], "MISS");

    let response = gateway.get_with_headers("/v1/models", &v1).await;
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(upstream_hits(&upstream).await, 2);
}

#[tokio::test]
async fn uncacheable_methods_bypass_the_store() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "POST", "/v1/models", "created").await;

    let gateway = TestGateway::start(&cached_route(
        &upstream,
        "      enabled: true\n      ttl: 60s\n",
    ))
    .await;

    let response = gateway.post_json("/v1/models", &json!({ "name": "m" })).await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.headers()["x-cache"], "BYPASS");

    let stats = gateway.stats().await;
    assert_eq!(stats["cache"]["entries"], 0);
}

#[tokio::test]
async fn admin_tag_invalidation_removes_only_the_tagged_region() {
    let openai = mock_upstream().await;
    let anthropic = mock_upstream().await;
    mount_ok(&openai, "GET", "/v1/openai/models", "openai").await;
    mount_ok(&anthropic, "GET", "/v1/anthropic/models", "anthropic").await;

    let gateway = TestGateway::start(&format!(
        r"
routes:
  - id: llm-openai
    pattern: /v1/openai/*
    upstream_base_url: {}
    cache:
      enabled: true
      ttl: 60s
      tags: ['upstream:openai']
  - id: llm-anthropic
    pattern: /v1/anthropic/*
    upstream_base_url: {}
    cache:
      enabled: true
      ttl: 60s
      tags: ['upstream:anthropic']
",
        openai.uri(),
        anthropic.uri()
    ))
    .await;

    for path in ["/v1/openai/models", "/v1/anthropic/models"] {
        let response = gateway.get(path).await;
        assert_eq!(response.headers()["x-cache"], "MISS");
    }

    let response = gateway
        .post_json(
            "/proxy/admin/cache/invalidate",
            &json!({ "scope": "tag", "tag": "upstream:openai" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["removed"], 1);

    // The invalidated region refetches; the other still replays.
    let response = gateway.get("/v1/openai/models").await;
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(upstream_hits(&openai).await, 2);

    let response = gateway.get("/v1/anthropic/models").await;
    assert_eq!(response.headers()["x-cache"], "HIT");
    assert_eq!(upstream_hits(&anthropic).await, 1);
}

#[tokio::test]
async fn rotation_events_flush_tagged_entries() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;

    let gateway = TestGateway::start(&format!(
        r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: {}
    cache:
      enabled: true
      ttl: 60s
      tags: ['upstream:openai']
invalidation:
  rules:
    - id: credential-rotation
      trigger: credential.rotated
      tags: ['upstream:{{resource}}']
",
        upstream.uri()
    ))
    .await;

    let response = gateway.get("/v1/models").await;
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(gateway.stats().await["cache"]["entries"], 1);

    let response = gateway
        .post_json(
            "/proxy/admin/events",
            &json!({ "kind": "credential.rotated", "resource": "openai" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 202);

    // The purge is applied by the invalidation worker, not inline.
    let purged = wait_for(
        || async { gateway.stats().await["cache"]["entries"] == 0 },
        Duration::from_secs(2),
    )
    .await;
    assert!(purged, "rotation event did not purge the tagged entries");

    let response = gateway.get("/v1/models").await;
    assert_eq!(response.headers()["x-cache"], "MISS");
    assert_eq!(upstream_hits(&upstream).await, 2);
}
