//! End-to-end relay behavior through the full HTTP surface.

use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::TestGateway;
use crate::upstream::{mock_upstream, mount_failing_then_ok, mount_ok, upstream_hits};

fn single_route(upstream: &MockServer, extra_route_yaml: &str) -> String {
    format!(
        r"
routes:
  - id: echo
    pattern: /v1/echo
    upstream_base_url: {}
{extra_route_yaml}",
        upstream.uri()
    )
}

#[tokio::test]
async fn credentials_are_injected_on_the_upstream_leg() {
    let upstream = mock_upstream().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(&format!(
        r"
routes:
  - id: llm-chat
    pattern: /v1/chat/*
    upstream_base_url: {}
    credential: openai
credentials:
  openai: Bearer sk-test
",
        upstream.uri()
    ))
    .await;

    let response = gateway
        .post_json("/v1/chat/completions", &json!({ "prompt": "hi" }))
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let body = TestGateway::json_body(response).await;
    assert_eq!(body["ok"], true);
    upstream.verify().await;
}

#[tokio::test]
async fn responses_carry_the_gateway_headers() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/echo", "direct").await;

    let gateway = TestGateway::start(&single_route(&upstream, "")).await;
    let response = gateway.get("/v1/echo").await;

    assert_eq!(response.status().as_u16(), 200);
    // No cache policy on the route, so the verdict is BYPASS.
    assert_eq!(response.headers()["x-cache"], "BYPASS");
    assert!(response.headers()["x-proxied-by"]
        .to_str()
        .unwrap()
        .starts_with("api-relay-gateway/"));
    assert!(response.headers().contains_key("x-proxy-request-id"));
}

#[tokio::test]
async fn unmatched_paths_return_the_error_envelope() {
    let upstream = mock_upstream().await;
    let gateway = TestGateway::start(&single_route(&upstream, "")).await;

    let response = gateway.get("/v2/elsewhere").await;
    assert_eq!(response.status().as_u16(), 404);

    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"]["code"], "route_not_found");

    let stats = gateway.stats().await;
    assert_eq!(stats["gateway"]["unmatched"], 1);
    assert_eq!(upstream_hits(&upstream).await, 0);
}

#[tokio::test]
async fn upstream_server_errors_keep_their_status() {
    let upstream = mock_upstream().await;
    Mock::given(method("GET"))
        .and(path("/v1/echo"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(&single_route(&upstream, "    max_retries: 0\n")).await;
    let response = gateway.get("/v1/echo").await;

    assert_eq!(response.status().as_u16(), 500);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"]["code"], "upstream_error");

    let stats = gateway.stats().await;
    assert_eq!(stats["gateway"]["upstream_failures"], 1);
}

#[tokio::test]
async fn idempotent_requests_retry_through_transient_errors() {
    let upstream = mock_upstream().await;
    mount_failing_then_ok(&upstream, "/v1/echo", 500, 1).await;

    let gateway = TestGateway::start(&single_route(
        &upstream,
        r"    max_retries: 1
    retry_backoff:
      strategy: fixed
      base_delay: 10ms
",
    ))
    .await;

    let response = gateway.get("/v1/echo").await;
    assert_eq!(response.status().as_u16(), 200);

    let body = TestGateway::json_body(response).await;
    assert_eq!(body["marker"], "recovered");
    assert_eq!(upstream_hits(&upstream).await, 2);
}

#[tokio::test]
async fn client_errors_relay_without_counting_against_the_route() {
    let upstream = mock_upstream().await;
    Mock::given(method("GET"))
        .and(path("/v1/echo"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({ "detail": "bad input" })))
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(&single_route(&upstream, "")).await;
    let response = gateway.get("/v1/echo").await;

    // 4xx means the upstream is healthy and the request was bad; it is
    // relayed as-is, not wrapped in the error envelope.
    assert_eq!(response.status().as_u16(), 422);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["detail"], "bad input");

    let health = TestGateway::json_body(gateway.get("/proxy/health").await).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["breakers"][0]["consecutive_failures"], 0);

    let stats = gateway.stats().await;
    assert_eq!(stats["gateway"]["upstream_failures"], 0);
}
