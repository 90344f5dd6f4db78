//! Configuration file loading.

use std::path::Path;

use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::model::GatewayConfig;

/// Loads, resolves, and validates a configuration file.
///
/// The format is chosen by extension: `.yaml`/`.yml` or `.toml`. Credential
/// `${ENV_VAR}` references are resolved before validation so a missing
/// variable fails the load rather than the first proxied request.
pub async fn load_from_path(path: impl AsRef<Path>) -> ConfigResult<GatewayConfig> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    let mut config = parse(path, &raw)?;
    config.resolve_credentials()?;
    config.validate()?;

    info!(
        path = %path.display(),
        routes = config.routes.len(),
        throttle_rules = config.throttle.rules.len(),
        invalidation_rules = config.invalidation.rules.len(),
        "configuration loaded"
    );
    Ok(config)
}

fn parse(path: &Path, raw: &str) -> ConfigResult<GatewayConfig> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml" | "yml") => {
            serde_yaml::from_str(raw).map_err(|e| ConfigError::parse(e.to_string()))
        }
        Some("toml") => toml::from_str(raw).map_err(|e| ConfigError::parse(e.to_string())),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}
