//! Quota and concurrency admission observed end to end.

use std::time::Duration;

use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::helpers::TestGateway;
use crate::upstream::{mock_upstream, mount_ok, upstream_body, upstream_hits};

#[tokio::test]
async fn quota_rejections_carry_backoff_headers() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;

    let gateway = TestGateway::start(&format!(
        r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: {}
    rate_limits:
      - scope: user
        limit: 2
        window: 1s
",
        upstream.uri()
    ))
    .await;

    let caller = [("x-caller-id", "svc-metering")];
    for _ in 0..2 {
        let response = gateway.get_with_headers("/v1/models", &caller).await;
        assert_eq!(response.status().as_u16(), 200);
    }

    let response = gateway.get_with_headers("/v1/models", &caller).await;
    assert_eq!(response.status().as_u16(), 429);
    assert_eq!(response.headers()["x-ratelimit-limit"], "2");
    assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
    assert!(response.headers().contains_key("retry-after"));

    let body = TestGateway::json_body(response).await;
    assert_eq!(body["error"]["code"], "rate_limited");
    assert!(body["error"]["retry_after_seconds"].as_u64().is_some());
    assert_eq!(upstream_hits(&upstream).await, 2);

    let stats = gateway.stats().await;
    assert_eq!(stats["gateway"]["throttled"], 1);

    // The window rolls over and the caller is admitted again.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let response = gateway.get_with_headers("/v1/models", &caller).await;
    assert_eq!(response.status().as_u16(), 200);
}

#[tokio::test]
async fn per_caller_quotas_do_not_leak_across_callers() {
    let upstream = mock_upstream().await;
    mount_ok(&upstream, "GET", "/v1/models", "models").await;

    let gateway = TestGateway::start(&format!(
        r"
routes:
  - id: models
    pattern: /v1/models
    upstream_base_url: {}
    rate_limits:
      - scope: user
        limit: 1
        window: 60s
",
        upstream.uri()
    ))
    .await;

    let response = gateway
        .get_with_headers("/v1/models", &[("x-caller-id", "svc-a")])
        .await;
    assert_eq!(response.status().as_u16(), 200);

    let response = gateway
        .get_with_headers("/v1/models", &[("x-caller-id", "svc-a")])
        .await;
    assert_eq!(response.status().as_u16(), 429);

    // A different caller has an untouched budget.
    let response = gateway
        .get_with_headers("/v1/models", &[("x-caller-id", "svc-b")])
        .await;
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(upstream_hits(&upstream).await, 2);
}

#[tokio::test]
async fn concurrency_ceiling_fast_fails_overlapping_calls() {
    let upstream = mock_upstream().await;
    Mock::given(method("GET"))
        .and(path("/v1/ocr/jobs"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(upstream_body("slow"))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&upstream)
        .await;

    let gateway = TestGateway::start(&format!(
        r"
routes:
  - id: ocr-jobs
    pattern: /v1/ocr/*
    upstream_base_url: {}
    max_concurrent_requests: 1
",
        upstream.uri()
    ))
    .await;

    let (first, second) = tokio::join!(gateway.get("/v1/ocr/jobs"), gateway.get("/v1/ocr/jobs"));

    let mut statuses = [first.status().as_u16(), second.status().as_u16()];
    statuses.sort_unstable();
    assert_eq!(statuses, [200, 429]);

    let rejected = if first.status().as_u16() == 429 {
        first
    } else {
        second
    };
    let body = TestGateway::json_body(rejected).await;
    assert_eq!(body["error"]["code"], "rate_limited");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("concurrency ceiling"));
    assert_eq!(upstream_hits(&upstream).await, 1);
}
