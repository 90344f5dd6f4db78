//! Root configuration model and structural validation.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ConfigError, ConfigResult};
use crate::route::{EndpointRoute, QuotaConfig};
use crate::rules::{InvalidationRuleConfig, ThrottleRuleConfig, ThrottleTuning};

/// Root of the gateway configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener and shutdown settings.
    #[serde(default)]
    pub server: ServerSettings,

    /// Logging settings.
    #[serde(default)]
    pub telemetry: TelemetrySettings,

    /// Response cache settings shared by all routes.
    #[serde(default)]
    pub cache: CacheSettings,

    /// Admission control settings shared by all routes.
    #[serde(default)]
    pub throttle: ThrottleSettings,

    /// Event-driven invalidation settings.
    #[serde(default)]
    pub invalidation: InvalidationSettings,

    /// Usage reporting settings.
    #[serde(default)]
    pub usage: UsageSettings,

    /// Endpoint routes, matched by descending priority.
    #[serde(default)]
    pub routes: Vec<EndpointRoute>,

    /// Upstream credential entries, referenced by name from routes.
    /// Values may be literals or `${ENV_VAR}` references resolved at load.
    #[serde(default)]
    pub credentials: HashMap<String, String>,
}

impl GatewayConfig {
    /// Validates cross-field rules the serde layer cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = std::collections::HashSet::new();
        for (idx, route) in self.routes.iter().enumerate() {
            let at = |field: &str| format!("routes[{idx}].{field}");

            if route.id.trim().is_empty() {
                return Err(ConfigError::validation(at("id"), "must not be empty"));
            }
            if !seen.insert(route.id.clone()) {
                return Err(ConfigError::validation(
                    at("id"),
                    format!("duplicate route id {:?}", route.id),
                ));
            }
            if !route.pattern.starts_with('/') {
                return Err(ConfigError::validation(
                    at("pattern"),
                    "must start with '/'",
                ));
            }

            let url = Url::parse(&route.upstream_base_url).map_err(|e| {
                ConfigError::validation(at("upstream_base_url"), e.to_string())
            })?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::validation(
                    at("upstream_base_url"),
                    format!("unsupported scheme {:?}", url.scheme()),
                ));
            }

            for method in &route.methods {
                if !is_known_method(method) {
                    return Err(ConfigError::validation(
                        at("methods"),
                        format!("unknown HTTP method {method:?}"),
                    ));
                }
            }

            if route.timeout.is_zero() {
                return Err(ConfigError::validation(at("timeout"), "must be positive"));
            }
            let backoff = &route.retry_backoff;
            if !(0.0..=1.0).contains(&backoff.jitter) {
                return Err(ConfigError::validation(
                    at("retry_backoff.jitter"),
                    "must be within [0, 1]",
                ));
            }
            if backoff.multiplier < 1.0 {
                return Err(ConfigError::validation(
                    at("retry_backoff.multiplier"),
                    "must be at least 1.0",
                ));
            }
            if route.max_concurrent_requests == Some(0) {
                return Err(ConfigError::validation(
                    at("max_concurrent_requests"),
                    "must be positive when set",
                ));
            }

            let breaker = &route.breaker;
            if breaker.enabled {
                if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                    return Err(ConfigError::validation(
                        at("breaker"),
                        "failure_threshold and success_threshold must be positive",
                    ));
                }
                if !(0.0..=1.0).contains(&breaker.failure_rate_threshold)
                    || breaker.failure_rate_threshold == 0.0
                {
                    return Err(ConfigError::validation(
                        at("breaker.failure_rate_threshold"),
                        "must be within (0, 1]",
                    ));
                }
                if breaker.window_size == 0 {
                    return Err(ConfigError::validation(
                        at("breaker.window_size"),
                        "must be positive",
                    ));
                }
                if breaker.half_open_max_probes == 0 {
                    return Err(ConfigError::validation(
                        at("breaker.half_open_max_probes"),
                        "must be positive",
                    ));
                }
            }

            for (qidx, quota) in route.rate_limits.iter().enumerate() {
                validate_quota(quota, &format!("routes[{idx}].rate_limits[{qidx}]"))?;
            }

            if route.cache.enabled && route.cache.ttl.is_zero() {
                return Err(ConfigError::validation(
                    at("cache.ttl"),
                    "must be positive when caching is enabled",
                ));
            }

            if let Some(name) = &route.credential {
                if !self.credentials.contains_key(name) {
                    return Err(ConfigError::validation(
                        at("credential"),
                        format!("references undefined credential {name:?}"),
                    ));
                }
            }
        }

        for (qidx, quota) in self.throttle.default_quotas.iter().enumerate() {
            validate_quota(quota, &format!("throttle.default_quotas[{qidx}]"))?;
        }

        let mut rule_ids = std::collections::HashSet::new();
        for (ridx, rule) in self.throttle.rules.iter().enumerate() {
            if !rule_ids.insert(rule.id.clone()) {
                return Err(ConfigError::validation(
                    format!("throttle.rules[{ridx}].id"),
                    format!("duplicate rule id {:?}", rule.id),
                ));
            }
            if let Some((start, end)) = rule.active_hours {
                if start > 23 || end > 24 {
                    return Err(ConfigError::validation(
                        format!("throttle.rules[{ridx}].active_hours"),
                        "hours must be within 0..=23 / 0..=24",
                    ));
                }
            }
        }

        for (ridx, rule) in self.invalidation.rules.iter().enumerate() {
            let scoped = !rule.tags.is_empty()
                || rule.pattern.is_some()
                || rule.route.is_some()
                || rule.flush_all;
            if !scoped {
                return Err(ConfigError::validation(
                    format!("invalidation.rules[{ridx}]"),
                    "must set tags, pattern, route, or flush_all",
                ));
            }
        }

        Ok(())
    }

    /// Resolves `${ENV_VAR}` credential references against the process
    /// environment, leaving literal values untouched.
    pub fn resolve_credentials(&mut self) -> ConfigResult<()> {
        for (name, value) in &mut self.credentials {
            if let Some(var) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
                match std::env::var(var) {
                    Ok(resolved) => *value = resolved,
                    Err(_) => {
                        return Err(ConfigError::MissingEnvVar {
                            name: var.to_owned(),
                            credential: name.clone(),
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// Looks up a route definition by id.
    #[must_use]
    pub fn route(&self, id: &str) -> Option<&EndpointRoute> {
        self.routes.iter().find(|r| r.id == id)
    }
}

fn validate_quota(quota: &QuotaConfig, location: &str) -> ConfigResult<()> {
    if quota.limit == 0 {
        return Err(ConfigError::validation(
            format!("{location}.limit"),
            "must be positive",
        ));
    }
    if quota.window.is_zero() {
        return Err(ConfigError::validation(
            format!("{location}.window"),
            "must be positive",
        ));
    }
    Ok(())
}

fn is_known_method(method: &str) -> bool {
    matches!(
        method,
        "GET" | "HEAD" | "POST" | "PUT" | "DELETE" | "PATCH" | "OPTIONS" | "TRACE"
    )
}

/// HTTP listener and shutdown settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Grace period for draining in-flight requests at shutdown.
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    pub graceful_shutdown_timeout: Duration,

    /// Largest request body accepted at the relay surface.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            graceful_shutdown_timeout: default_shutdown_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_body_bytes() -> usize {
    2 * 1024 * 1024
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Default log filter, overridable by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of human-readable ones.
    #[serde(default)]
    pub log_json: bool,

    /// Service name attached to log context.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            service_name: default_service_name(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_service_name() -> String {
    "api-relay-gateway".to_owned()
}

/// Response cache settings shared by all routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Master switch; per-route policies are ignored when off.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Entry ceiling before oldest-expiry eviction.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Interval between expired-entry sweeps.
    #[serde(with = "humantime_serde", default = "default_sweep_interval")]
    pub sweep_interval: Duration,

    /// Entries removed per sweep batch.
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_entries: default_max_entries(),
            sweep_interval: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_max_entries() -> usize {
    10_000
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_sweep_batch() -> usize {
    256
}

/// Admission control settings shared by all routes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleSettings {
    /// Master switch for the whole admission layer.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Enable the adaptive (current-load) strategy.
    #[serde(default = "default_enabled")]
    pub adaptive_enabled: bool,

    /// Enable the predictive (projected-load) strategy.
    #[serde(default = "default_enabled")]
    pub predictive_enabled: bool,

    /// Enable the behavioral (per-caller anomaly) strategy.
    #[serde(default = "default_enabled")]
    pub behavior_enabled: bool,

    /// Lifetime of cached throttle decisions.
    #[serde(with = "humantime_serde", default = "default_decision_ttl")]
    pub decision_cache_ttl: Duration,

    /// Quotas applied to scopes with no route-level override.
    #[serde(default)]
    pub default_quotas: Vec<QuotaConfig>,

    /// Static throttling rules, evaluated by descending priority.
    #[serde(default)]
    pub rules: Vec<ThrottleRuleConfig>,

    /// Heuristic knobs for the three strategies.
    #[serde(default)]
    pub tuning: ThrottleTuning,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            adaptive_enabled: default_enabled(),
            predictive_enabled: default_enabled(),
            behavior_enabled: default_enabled(),
            decision_cache_ttl: default_decision_ttl(),
            default_quotas: Vec::new(),
            rules: Vec::new(),
            tuning: ThrottleTuning::default(),
        }
    }
}

fn default_decision_ttl() -> Duration {
    Duration::from_secs(10)
}

/// Event-driven invalidation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationSettings {
    /// Queue capacity for pending invalidation events.
    #[serde(default = "default_event_queue")]
    pub queue_capacity: usize,

    /// Events handled per worker batch.
    #[serde(default = "default_event_batch")]
    pub batch_size: usize,

    /// Rules matched against queued events.
    #[serde(default)]
    pub rules: Vec<InvalidationRuleConfig>,
}

impl Default for InvalidationSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_event_queue(),
            batch_size: default_event_batch(),
            rules: Vec::new(),
        }
    }
}

fn default_event_queue() -> usize {
    1024
}

fn default_event_batch() -> usize {
    64
}

/// Usage reporting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSettings {
    /// Queue capacity for completed-transaction samples. When full, new
    /// samples are dropped and counted rather than blocking the pipeline.
    #[serde(default = "default_usage_queue")]
    pub queue_capacity: usize,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_usage_queue(),
        }
    }
}

fn default_usage_queue() -> usize {
    2048
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_route(route_yaml: &str) -> GatewayConfig {
        let yaml = format!("routes:\n{route_yaml}");
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn empty_config_is_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.cache.max_entries, 10_000);
    }

    #[test]
    fn duplicate_route_ids_rejected() {
        let config = config_with_route(
            r"
  - id: a
    pattern: /x
    upstream_base_url: https://up.example.com
  - id: a
    pattern: /y
    upstream_base_url: https://up.example.com
",
        );
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { .. }));
        assert!(err.to_string().contains("duplicate route id"));
    }

    #[test]
    fn bad_upstream_scheme_rejected() {
        let config = config_with_route(
            r"
  - id: a
    pattern: /x
    upstream_base_url: ftp://up.example.com
",
        );
        assert!(config.validate().is_err());
    }

    #[test]
    fn undefined_credential_reference_rejected() {
        let config = config_with_route(
            r"
  - id: a
    pattern: /x
    upstream_base_url: https://up.example.com
    credential: openai
",
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("undefined credential"));
    }

    #[test]
    fn env_credentials_resolve() {
        std::env::set_var("RELAY_TEST_TOKEN", "sk-123");
        let mut config: GatewayConfig = serde_yaml::from_str(
            r#"
credentials:
  upstream-a: "${RELAY_TEST_TOKEN}"
  upstream-b: "literal-token"
"#,
        )
        .unwrap();
        config.resolve_credentials().unwrap();
        assert_eq!(config.credentials["upstream-a"], "sk-123");
        assert_eq!(config.credentials["upstream-b"], "literal-token");
    }

    #[test]
    fn missing_env_credential_errors() {
        let mut config: GatewayConfig = serde_yaml::from_str(
            r#"
credentials:
  upstream-a: "${RELAY_TEST_DOES_NOT_EXIST}"
"#,
        )
        .unwrap();
        let err = config.resolve_credentials().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar { .. }));
    }

    #[test]
    fn unscoped_invalidation_rule_rejected() {
        let config: GatewayConfig = serde_yaml::from_str(
            r"
invalidation:
  rules:
    - id: r1
      trigger: credential.rotated
",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
