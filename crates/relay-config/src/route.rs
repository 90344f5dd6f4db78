//! Endpoint route definitions.
//!
//! A route binds a path pattern to an upstream base URL together with every
//! policy the pipeline applies on that path: timeout, retry, concurrency
//! ceiling, circuit breaker thresholds, response caching, and per-scope
//! quotas. Routes are matched by descending `priority`; equal priorities are
//! disambiguated by weighted random selection.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One configured endpoint route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointRoute {
    /// Unique route identifier, referenced by breakers, caches, and quotas.
    pub id: String,

    /// Path pattern. Supports `*` (one segment) and `**` (rest of the path),
    /// e.g. `/v1/chat/**` or `/v1/ocr/*/scan`.
    pub pattern: String,

    /// Upstream base URL the matched path is appended to.
    pub upstream_base_url: String,

    /// Methods this route accepts, uppercase. Empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Match precedence; higher values are tried first.
    #[serde(default)]
    pub priority: i32,

    /// Relative weight among routes sharing the same priority.
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Upstream call deadline.
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    /// Maximum retry attempts after the initial call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff schedule between retry attempts.
    #[serde(default)]
    pub retry_backoff: RetryBackoffConfig,

    /// Concurrent in-flight ceiling for this route. `None` means unbounded.
    #[serde(default)]
    pub max_concurrent_requests: Option<u32>,

    /// Response caching policy.
    #[serde(default)]
    pub cache: RouteCacheConfig,

    /// Circuit breaker thresholds and recovery behavior.
    #[serde(default)]
    pub breaker: RouteBreakerConfig,

    /// Static per-scope quotas enforced before any adaptive logic.
    #[serde(default)]
    pub rate_limits: Vec<QuotaConfig>,

    /// Request headers removed before forwarding, lowercase.
    #[serde(default)]
    pub strip_request_headers: Vec<String>,

    /// Static headers injected into every upstream call.
    #[serde(default)]
    pub upstream_headers: HashMap<String, String>,

    /// Header that carries the upstream credential.
    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    /// Name of the credential entry used for upstream authentication.
    #[serde(default)]
    pub credential: Option<String>,
}

fn default_weight() -> u32 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    2
}

fn default_auth_header() -> String {
    "authorization".to_owned()
}

/// Backoff schedule applied between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryBackoffConfig {
    /// Fixed or exponential delay growth.
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Growth factor for the exponential strategy.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Random jitter fraction in `[0, 1]` applied to each delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

/// Delay growth strategy between retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay before every attempt.
    Fixed,
    /// Delay doubles (times `multiplier`) per attempt.
    #[default]
    Exponential,
}

/// Response caching policy for a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCacheConfig {
    /// Whether responses on this route are cached at all.
    #[serde(default)]
    pub enabled: bool,

    /// Entry lifetime.
    #[serde(with = "humantime_serde", default = "default_cache_ttl")]
    pub ttl: Duration,

    /// Request headers whose values participate in the cache key, lowercase.
    #[serde(default)]
    pub vary_headers: Vec<String>,

    /// Tags attached to every entry stored for this route.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Methods eligible for caching, uppercase.
    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,
}

impl Default for RouteCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: default_cache_ttl(),
            vary_headers: Vec::new(),
            tags: Vec::new(),
            methods: default_cache_methods(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_owned(), "HEAD".to_owned()]
}

/// Circuit breaker thresholds for a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteBreakerConfig {
    /// Whether the breaker guards this route.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that trip the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes required to close.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Windowed failure ratio in `(0, 1]` that trips the breaker.
    #[serde(default = "default_failure_rate")]
    pub failure_rate_threshold: f64,

    /// Minimum windowed samples before the ratio trigger applies.
    #[serde(default = "default_min_samples")]
    pub min_samples: u32,

    /// Mean windowed latency that trips the breaker, if set.
    #[serde(with = "humantime_serde::option", default)]
    pub avg_latency_threshold: Option<Duration>,

    /// Sliding window capacity in samples.
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Concurrent probe ceiling while half-open.
    #[serde(default = "default_half_open_probes")]
    pub half_open_max_probes: u32,

    /// How the breaker decides when to probe again after opening.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for RouteBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            failure_rate_threshold: default_failure_rate(),
            min_samples: default_min_samples(),
            avg_latency_threshold: None,
            window_size: default_window_size(),
            half_open_max_probes: default_half_open_probes(),
            recovery: RecoveryConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_min_samples() -> u32 {
    10
}

fn default_window_size() -> usize {
    100
}

fn default_half_open_probes() -> u32 {
    3
}

/// Recovery strategy selecting when an open breaker transitions to half-open.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RecoveryConfig {
    /// Probe on the next request after opening.
    Immediate,

    /// Probe after a fixed cool-down.
    FixedTimeout {
        /// Cool-down before the first probe.
        #[serde(with = "humantime_serde", default = "default_recovery_timeout")]
        timeout: Duration,
    },

    /// Cool-down grows per failed recovery attempt, capped.
    ExponentialBackoff {
        /// Cool-down before the first probe.
        #[serde(with = "humantime_serde", default = "default_min_recovery")]
        min_timeout: Duration,
        /// Ceiling on the grown cool-down.
        #[serde(with = "humantime_serde", default = "default_max_recovery")]
        max_timeout: Duration,
        /// Growth factor per failed recovery attempt.
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },

    /// Probe once recent health clears a score threshold and a minimum
    /// cool-down has elapsed.
    Adaptive {
        /// Minimum cool-down regardless of score.
        #[serde(with = "humantime_serde", default = "default_min_recovery")]
        min_timeout: Duration,
        /// Health score in `(0, 1]` required to probe.
        #[serde(default = "default_health_threshold")]
        health_threshold: f64,
    },
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self::FixedTimeout {
            timeout: default_recovery_timeout(),
        }
    }
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_min_recovery() -> Duration {
    Duration::from_secs(10)
}

fn default_max_recovery() -> Duration {
    Duration::from_secs(300)
}

fn default_health_threshold() -> f64 {
    0.7
}

/// Scope a quota or throttling decision applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaScope {
    /// The whole gateway.
    Global,
    /// A single caller.
    User,
    /// All callers of one tenant.
    Organization,
    /// One configured route.
    Endpoint,
}

impl QuotaScope {
    /// Stable name used in scope keys and rejection reasons.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::User => "user",
            Self::Organization => "organization",
            Self::Endpoint => "endpoint",
        }
    }
}

/// A fixed-window request quota.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Scope the counter is keyed by.
    pub scope: QuotaScope,

    /// Admitted requests per window.
    pub limit: u64,

    /// Window length.
    #[serde(with = "humantime_serde", default = "default_quota_window")]
    pub window: Duration,
}

fn default_quota_window() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_route_gets_defaults() {
        let yaml = r"
id: llm-chat
pattern: /v1/chat/**
upstream_base_url: https://api.example.com
";
        let route: EndpointRoute = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(route.id, "llm-chat");
        assert_eq!(route.timeout, Duration::from_secs(30));
        assert_eq!(route.max_retries, 2);
        assert_eq!(route.weight, 1);
        assert!(route.methods.is_empty());
        assert!(!route.cache.enabled);
        assert!(route.breaker.enabled);
        assert_eq!(route.auth_header, "authorization");
        assert!(matches!(
            route.breaker.recovery,
            RecoveryConfig::FixedTimeout { .. }
        ));
    }

    #[test]
    fn recovery_strategy_parses_tagged() {
        let yaml = r"
strategy: exponential_backoff
min_timeout: 5s
max_timeout: 2m
multiplier: 3.0
";
        let recovery: RecoveryConfig = serde_yaml::from_str(yaml).unwrap();
        match recovery {
            RecoveryConfig::ExponentialBackoff {
                min_timeout,
                max_timeout,
                multiplier,
            } => {
                assert_eq!(min_timeout, Duration::from_secs(5));
                assert_eq!(max_timeout, Duration::from_secs(120));
                assert!((multiplier - 3.0).abs() < f64::EPSILON);
            }
            other => panic!("unexpected recovery: {other:?}"),
        }
    }

    #[test]
    fn quota_parses_humantime_window() {
        let yaml = r"
scope: user
limit: 10
window: 1m
";
        let quota: QuotaConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(quota.scope, QuotaScope::User);
        assert_eq!(quota.limit, 10);
        assert_eq!(quota.window, Duration::from_secs(60));
    }

    #[test]
    fn breaker_latency_threshold_optional() {
        let yaml = r"
avg_latency_threshold: 750ms
";
        let breaker: RouteBreakerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            breaker.avg_latency_threshold,
            Some(Duration::from_millis(750))
        );
    }
}
