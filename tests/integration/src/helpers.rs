//! Harness that runs the real gateway on a loopback listener.
//!
//! Tests drive the gateway over actual HTTP with `reqwest`, and the
//! gateway's own `reqwest` transport calls wiremock upstreams, so every
//! scenario exercises the full path a production request takes.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::{Client, Response};
use serde_json::Value;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use relay_config::{ConfigHandle, GatewayConfig, ServerSettings};
use relay_pipeline::{HttpTransport, LogUsageSink, Pipeline};
use relay_server::{router, AppState};
use relay_throttle::NullMetricsFeed;

/// Initialize tracing for tests (only once, and only under TEST_LOG).
static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
});

/// Forces tracing initialization.
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// A gateway serving on an ephemeral loopback port with its background
/// workers running.
pub struct TestGateway {
    /// Bound address.
    pub addr: SocketAddr,
    /// Client for driving the gateway.
    pub client: Client,
    /// `http://addr`.
    pub base_url: String,
    /// Shared state, for white-box assertions.
    pub state: AppState,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestGateway {
    /// Starts a gateway from an inline YAML config. Reload endpoints are
    /// disabled because there is no file to re-read.
    pub async fn start(config_yaml: &str) -> Self {
        Self::start_inner(config_yaml, None).await
    }

    /// Writes `config_yaml` to `path` and starts a gateway that re-reads
    /// that file on `POST /proxy/admin/reload`.
    pub async fn start_with_file(config_yaml: &str, path: PathBuf) -> Self {
        std::fs::write(&path, config_yaml).expect("write config file");
        Self::start_inner(config_yaml, Some(path)).await
    }

    async fn start_inner(config_yaml: &str, path: Option<PathBuf>) -> Self {
        init_tracing();
        let config: GatewayConfig = serde_yaml::from_str(config_yaml).expect("parse test config");

        let transport = Arc::new(HttpTransport::new().expect("build transport"));
        let (pipeline, workers) = Pipeline::new(
            config.clone(),
            transport,
            Arc::new(NullMetricsFeed),
            Arc::new(LogUsageSink),
        )
        .expect("build pipeline");
        let pipeline = Arc::new(pipeline);

        tokio::spawn(workers.invalidation.run());
        tokio::spawn(workers.usage.run());

        let state = AppState::new(pipeline, Arc::new(ConfigHandle::new(config)), path);

        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");

        let app = router(state.clone(), &ServerSettings::default());
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("build client");

        Self {
            addr,
            client,
            base_url: format!("http://{addr}"),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Full URL for a gateway path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET a path.
    pub async fn get(&self, path: &str) -> Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("request failed")
    }

    /// GET a path with extra headers.
    pub async fn get_with_headers(&self, path: &str, headers: &[(&str, &str)]) -> Response {
        let mut builder = self.client.get(self.url(path));
        for (key, value) in headers {
            builder = builder.header(*key, *value);
        }
        builder.send().await.expect("request failed")
    }

    /// POST a JSON body to a path.
    pub async fn post_json(&self, path: &str, body: &Value) -> Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("request failed")
    }

    /// POST with an empty body, for admin endpoints.
    pub async fn post_empty(&self, path: &str) -> Response {
        self.client
            .post(self.url(path))
            .send()
            .await
            .expect("request failed")
    }

    /// Parses a response body as JSON.
    pub async fn json_body(response: Response) -> Value {
        response.json().await.expect("parse json body")
    }

    /// Fetches and parses `/proxy/stats`.
    pub async fn stats(&self) -> Value {
        Self::json_body(self.get("/proxy/stats").await).await
    }

    /// Stops accepting connections.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Polls `condition` until it returns true or `timeout` elapses.
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// A config file path in the system temp directory that is removed on drop.
pub struct TempConfigFile {
    /// The path, unique per instance.
    pub path: PathBuf,
}

impl TempConfigFile {
    /// Allocates a fresh path; nothing is written yet.
    pub fn new() -> Self {
        let path = std::env::temp_dir().join(format!("relay-test-{}.yaml", uuid::Uuid::new_v4()));
        Self { path }
    }

    /// Replaces the file contents, as an operator editing the config would.
    pub fn rewrite(&self, contents: &str) {
        std::fs::write(&self.path, contents).expect("rewrite config file");
    }
}

impl Default for TempConfigFile {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TempConfigFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
