//! Shared handler state.

use std::path::PathBuf;
use std::sync::Arc;

use relay_config::ConfigHandle;
use relay_pipeline::Pipeline;

/// Everything the HTTP handlers need, cheap to clone per request.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The relay pipeline serving proxied traffic.
    pub pipeline: Arc<Pipeline>,
    /// Versioned record of the most recently accepted configuration.
    pub config: Arc<ConfigHandle>,
    /// Config file backing `POST /proxy/admin/reload`. `None` when the
    /// gateway was started from an inline configuration; the endpoint then
    /// rejects reload requests.
    pub config_path: Option<PathBuf>,
}

impl AppState {
    /// Bundles the pipeline with its configuration bookkeeping.
    #[must_use]
    pub fn new(
        pipeline: Arc<Pipeline>,
        config: Arc<ConfigHandle>,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            pipeline,
            config,
            config_path,
        }
    }
}
