//! Pipeline construction and reload failures.

use thiserror::Error;

use relay_config::ConfigError;
use relay_routing::RoutingError;

/// Why a pipeline could not be built or a reload was refused.
///
/// Request-path failures are [`relay_core::RelayError`]; this type only
/// covers the control plane, where a bad configuration must leave the
/// previous snapshot serving.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Route definitions could not be compiled into a table.
    #[error(transparent)]
    Routing(#[from] RoutingError),
}
