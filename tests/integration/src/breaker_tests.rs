//! Circuit breaker behavior observed through the relay and admin surfaces.

use std::time::Duration;

use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::TestGateway;
use crate::upstream::{mock_upstream, mount_failing_then_ok, mount_ok, upstream_hits};

fn guarded_route(upstream: &MockServer, breaker_yaml: &str) -> String {
    format!(
        r"
routes:
  - id: ocr-scan
    pattern: /v1/ocr/*
    upstream_base_url: {}
    max_retries: 0
    breaker:
{breaker_yaml}",
        upstream.uri()
    )
}

#[tokio::test]
async fn breaker_opens_after_consecutive_failures() {
    let upstream = mock_upstream().await;
    Mock::given(method("GET"))
        .and(path("/v1/ocr/scan"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(&guarded_route(
        &upstream,
        "      failure_threshold: 3\n",
    ))
    .await;

    for _ in 0..3 {
        let response = gateway.get("/v1/ocr/scan").await;
        assert_eq!(response.status().as_u16(), 500);
    }

    // The third failure trips the breaker; the fourth call never leaves
    // the gateway.
    let response = gateway.get("/v1/ocr/scan").await;
    assert_eq!(response.status().as_u16(), 503);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"]["code"], "circuit_open");
    assert_eq!(upstream_hits(&upstream).await, 3);

    let health = TestGateway::json_body(gateway.get("/proxy/health").await).await;
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["breakers"][0]["state"], "open");

    let stats = gateway.stats().await;
    assert_eq!(stats["gateway"]["breaker_rejections"], 1);
}

#[tokio::test]
async fn open_breaker_recovers_through_a_half_open_probe() {
    let upstream = mock_upstream().await;
    mount_failing_then_ok(&upstream, "/v1/ocr/scan", 500, 1).await;

    let gateway = TestGateway::start(&guarded_route(
        &upstream,
        r"      failure_threshold: 1
      success_threshold: 1
      recovery:
        strategy: fixed_timeout
        timeout: 1s
",
    ))
    .await;

    let response = gateway.get("/v1/ocr/scan").await;
    assert_eq!(response.status().as_u16(), 500);

    let response = gateway.get("/v1/ocr/scan").await;
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(upstream_hits(&upstream).await, 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The recovery timeout has elapsed, so this call rides through as
    // the half-open probe and its success closes the breaker.
    let response = gateway.get("/v1/ocr/scan").await;
    assert_eq!(response.status().as_u16(), 200);
    let body = TestGateway::json_body(response).await;
    assert_eq!(body["marker"], "recovered");

    let health = TestGateway::json_body(gateway.get("/proxy/health").await).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["breakers"][0]["state"], "closed");
}

#[tokio::test]
async fn forced_open_breaker_short_circuits_until_released() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/ocr/scan", "ok").await;

    let gateway = TestGateway::start(&guarded_route(&upstream, "      failure_threshold: 5\n")).await;

    let response = gateway
        .post_empty("/proxy/admin/breakers/ocr-scan/force-open")
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let response = gateway.get("/v1/ocr/scan").await;
    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(upstream_hits(&upstream).await, 0);

    let response = gateway
        .post_empty("/proxy/admin/breakers/ocr-scan/force-close")
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let response = gateway.get("/v1/ocr/scan").await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(upstream_hits(&upstream).await, 1);
}
