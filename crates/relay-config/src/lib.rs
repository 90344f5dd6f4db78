//! # Relay Config
//!
//! Configuration management for the API relay gateway.
//!
//! The file model is declarative: operators describe endpoint routes with
//! their resilience, throttling, and caching policies, and the gateway
//! compiles a runtime snapshot from it. Snapshots are immutable; a reload
//! parses and validates the whole file and then publishes a new snapshot
//! atomically, so in-flight requests never observe a half-applied change.
//!
//! Supported formats: YAML and TOML, selected by file extension.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod handle;
pub mod loader;
pub mod model;
pub mod route;
pub mod rules;
pub mod watcher;

pub use error::{ConfigError, ConfigResult};
pub use handle::ConfigHandle;
pub use loader::load_from_path;
pub use model::{
    CacheSettings, GatewayConfig, InvalidationSettings, ServerSettings, TelemetrySettings,
    ThrottleSettings, UsageSettings,
};
pub use route::{
    EndpointRoute, QuotaConfig, QuotaScope, RecoveryConfig, RetryBackoffConfig, RetryStrategy,
    RouteBreakerConfig, RouteCacheConfig,
};
pub use rules::{
    AdaptiveTuning, BehaviorTuning, InvalidationRuleConfig, PredictiveTuning, ThrottleLevelConfig,
    ThrottleRuleConfig, ThrottleTrigger, ThrottleTuning,
};
pub use watcher::ConfigWatcher;
