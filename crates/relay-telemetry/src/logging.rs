//! Tracing subscriber setup.
//!
//! One global subscriber for the whole process: an `EnvFilter` seeded from
//! `RUST_LOG` (falling back to the configured level) feeding either a
//! human-readable or a JSON formatting layer.

use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_config::TelemetrySettings;

/// Logging initialization failure.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The global subscriber could not be installed.
    #[error("failed to initialize logging: {0}")]
    Init(String),
}

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level so operators can crank up
/// verbosity without touching the config file.
pub fn init_logging(settings: &TelemetrySettings) -> Result<(), TelemetryError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));

    let registry = tracing_subscriber::registry().with(filter);
    if settings.log_json {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
            .map_err(|e| TelemetryError::Init(e.to_string()))?;
    } else {
        registry
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| TelemetryError::Init(e.to_string()))?;
    }

    info!(
        service = %settings.service_name,
        level = %settings.log_level,
        json = settings.log_json,
        "logging initialized"
    );
    Ok(())
}
