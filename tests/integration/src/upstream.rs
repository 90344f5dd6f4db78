//! Mock upstream services backed by wiremock.

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Starts an empty mock upstream.
pub async fn mock_upstream() -> MockServer {
    MockServer::start().await
}

/// A small JSON payload standing in for an upstream reply; `marker` makes
/// responses distinguishable across mounts.
pub fn upstream_body(marker: &str) -> Value {
    json!({ "object": "list", "marker": marker })
}

/// Mounts a 200 JSON responder.
pub async fn mount_ok(server: &MockServer, http_method: &str, route_path: &str, marker: &str) {
    Mock::given(method(http_method))
        .and(path(route_path))
        .respond_with(ResponseTemplate::new(200).set_body_json(upstream_body(marker)))
        .mount(server)
        .await;
}

/// Mounts a responder that answers `status` for the first `times` calls,
/// then 200. Mount order decides precedence, so the failure mock expires
/// and the fallback takes over.
pub async fn mount_failing_then_ok(server: &MockServer, route_path: &str, status: u16, times: u64) {
    Mock::given(method("GET"))
        .and(path(route_path))
        .respond_with(ResponseTemplate::new(status))
        .up_to_n_times(times)
        .mount(server)
        .await;
    mount_ok(server, "GET", route_path, "recovered").await;
}

/// Requests the upstream has received so far.
pub async fn upstream_hits(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .map_or(0, |requests| requests.len())
}
