//! Static throttling rules, heuristic tuning, and invalidation rules.
//!
//! The adaptive, predictive, and behavioral throttling strategies all carry
//! numeric knobs. None of them are hard-coded: they live here with defaults
//! so operators can tune a deployment without rebuilding.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::route::QuotaScope;

/// Condition kind a static throttling rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleTrigger {
    /// System-wide load metric above threshold.
    HighLoad,
    /// Scope request volume spiking over its typical rate.
    UsageSpike,
    /// Accumulated upstream cost above threshold.
    CostThreshold,
    /// Upstream latency or error rate degrading.
    PerformanceDegradation,
    /// Always active inside the configured hours.
    TimeBased,
}

/// Throttling level a rule imposes when it matches.
///
/// Rejection rates per level are fixed by the admission contract; rules pick
/// the level, not the rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleLevelConfig {
    /// Reject roughly a quarter of traffic.
    Light,
    /// Reject half.
    Moderate,
    /// Reject three quarters.
    Heavy,
    /// Reject almost everything.
    Emergency,
}

/// One statically configured throttling rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleRuleConfig {
    /// Unique rule identifier, echoed in throttle decisions.
    pub id: String,

    /// Condition the rule reacts to.
    pub trigger: ThrottleTrigger,

    /// Trigger threshold; unit depends on the trigger (load factor, spike
    /// multiplier, cost units, latency milliseconds).
    #[serde(default)]
    pub threshold: f64,

    /// Level imposed when the rule matches.
    pub level: ThrottleLevelConfig,

    /// Scope kind the rule applies to. `None` applies to every scope.
    #[serde(default)]
    pub scope: Option<QuotaScope>,

    /// Restrict the rule to a single scope value, e.g. one caller id.
    #[serde(default)]
    pub scope_value: Option<String>,

    /// Active hour range `[start, end)` in UTC, e.g. `[9, 17]`. `None` means
    /// always active.
    #[serde(default)]
    pub active_hours: Option<(u8, u8)>,

    /// Evaluation precedence; higher first.
    #[serde(default)]
    pub priority: u32,

    /// Suggested client back-off when this rule rejects.
    #[serde(with = "humantime_serde", default = "default_rule_retry_after")]
    pub retry_after: Duration,

    /// Disabled rules are kept in config but never evaluated.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_rule_retry_after() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

/// Tuning for the adaptive (current-load) strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveTuning {
    /// Weight of normalized response time in the performance score.
    #[serde(default = "default_response_time_weight")]
    pub response_time_weight: f64,

    /// Weight of normalized throughput.
    #[serde(default = "default_throughput_weight")]
    pub throughput_weight: f64,

    /// Weight of error rate.
    #[serde(default = "default_error_rate_weight")]
    pub error_rate_weight: f64,

    /// Weight of resource utilization.
    #[serde(default = "default_utilization_weight")]
    pub utilization_weight: f64,

    /// Score at or below which light throttling engages.
    #[serde(default = "default_light_score")]
    pub light_score: f64,

    /// Score at or below which moderate throttling engages.
    #[serde(default = "default_moderate_score")]
    pub moderate_score: f64,

    /// Score at or below which heavy throttling engages.
    #[serde(default = "default_heavy_score")]
    pub heavy_score: f64,

    /// Score at or below which emergency throttling engages.
    #[serde(default = "default_emergency_score")]
    pub emergency_score: f64,

    /// Metrics older than this are ignored entirely.
    #[serde(with = "humantime_serde", default = "default_staleness")]
    pub staleness: Duration,
}

impl Default for AdaptiveTuning {
    fn default() -> Self {
        Self {
            response_time_weight: default_response_time_weight(),
            throughput_weight: default_throughput_weight(),
            error_rate_weight: default_error_rate_weight(),
            utilization_weight: default_utilization_weight(),
            light_score: default_light_score(),
            moderate_score: default_moderate_score(),
            heavy_score: default_heavy_score(),
            emergency_score: default_emergency_score(),
            staleness: default_staleness(),
        }
    }
}

fn default_response_time_weight() -> f64 {
    0.3
}

fn default_throughput_weight() -> f64 {
    0.2
}

fn default_error_rate_weight() -> f64 {
    0.3
}

fn default_utilization_weight() -> f64 {
    0.2
}

fn default_light_score() -> f64 {
    0.75
}

fn default_moderate_score() -> f64 {
    0.6
}

fn default_heavy_score() -> f64 {
    0.4
}

fn default_emergency_score() -> f64 {
    0.2
}

fn default_staleness() -> Duration {
    Duration::from_secs(30)
}

/// Tuning for the predictive (near-future load) strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictiveTuning {
    /// Rolling per-scope history length in buckets.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Length of one history bucket.
    #[serde(with = "humantime_serde", default = "default_bucket_length")]
    pub bucket_length: Duration,

    /// Completed buckets required before projections apply.
    #[serde(default = "default_min_buckets")]
    pub min_buckets: usize,

    /// Coefficient of variation at or above which traffic is `spiky`.
    #[serde(default = "default_spiky_cv")]
    pub spiky_cv: f64,

    /// Coefficient of variation at or above which traffic is `burst`.
    #[serde(default = "default_burst_cv")]
    pub burst_cv: f64,

    /// Coefficient of variation at or above which traffic is `gradual`.
    #[serde(default = "default_gradual_cv")]
    pub gradual_cv: f64,

    /// Projection over typical load that imposes moderate throttling.
    #[serde(default = "default_moderate_projection")]
    pub moderate_projection: f64,

    /// Projection over typical load that imposes light throttling.
    #[serde(default = "default_light_projection")]
    pub light_projection: f64,

    /// Multiplier applied during historical peak hours.
    #[serde(default = "default_peak_hour_weight")]
    pub peak_hour_weight: f64,

    /// Smoothing factor for the load trend estimate.
    #[serde(default = "default_trend_smoothing")]
    pub trend_smoothing: f64,

    /// Projection multiplier for `spiky` traffic.
    #[serde(default = "default_spiky_factor")]
    pub spiky_factor: f64,

    /// Projection multiplier for `burst` traffic.
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,

    /// Projection multiplier for `gradual` traffic.
    #[serde(default = "default_gradual_factor")]
    pub gradual_factor: f64,
}

impl Default for PredictiveTuning {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
            bucket_length: default_bucket_length(),
            min_buckets: default_min_buckets(),
            spiky_cv: default_spiky_cv(),
            burst_cv: default_burst_cv(),
            gradual_cv: default_gradual_cv(),
            moderate_projection: default_moderate_projection(),
            light_projection: default_light_projection(),
            peak_hour_weight: default_peak_hour_weight(),
            trend_smoothing: default_trend_smoothing(),
            spiky_factor: default_spiky_factor(),
            burst_factor: default_burst_factor(),
            gradual_factor: default_gradual_factor(),
        }
    }
}

fn default_history_window() -> usize {
    60
}

fn default_bucket_length() -> Duration {
    Duration::from_secs(10)
}

fn default_min_buckets() -> usize {
    6
}

fn default_spiky_cv() -> f64 {
    1.0
}

fn default_burst_cv() -> f64 {
    0.6
}

fn default_gradual_cv() -> f64 {
    0.3
}

fn default_moderate_projection() -> f64 {
    1.5
}

fn default_light_projection() -> f64 {
    1.0
}

fn default_peak_hour_weight() -> f64 {
    1.3
}

fn default_trend_smoothing() -> f64 {
    0.3
}

fn default_spiky_factor() -> f64 {
    1.5
}

fn default_burst_factor() -> f64 {
    1.25
}

fn default_gradual_factor() -> f64 {
    1.1
}

/// Tuning for the behavioral (per-caller anomaly) strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorTuning {
    /// EMA smoothing factor for caller profiles.
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// Anomaly weight of the request-rate multiplier.
    #[serde(default = "default_rate_weight")]
    pub rate_weight: f64,

    /// Anomaly weight of the payload-volume multiplier.
    #[serde(default = "default_volume_weight")]
    pub volume_weight: f64,

    /// Anomaly weight of the never-seen-endpoint ratio.
    #[serde(default = "default_endpoint_weight")]
    pub endpoint_weight: f64,

    /// Anomaly weight of activity outside the caller's usual hours.
    #[serde(default = "default_hours_weight")]
    pub hours_weight: f64,

    /// Anomaly weight of sub-second request spacing.
    #[serde(default = "default_spacing_weight")]
    pub spacing_weight: f64,

    /// Request-rate multiple of the caller's profile at which the rate
    /// component saturates.
    #[serde(default = "default_rate_multiplier")]
    pub rate_multiplier: f64,

    /// Payload-volume multiple of the caller's profile at which the volume
    /// component saturates.
    #[serde(default = "default_volume_multiplier")]
    pub volume_multiplier: f64,

    /// Anomaly score at or above which light throttling engages.
    #[serde(default = "default_light_anomaly")]
    pub light_score: f64,

    /// Anomaly score at or above which moderate throttling engages.
    #[serde(default = "default_moderate_anomaly")]
    pub moderate_score: f64,

    /// Anomaly score at or above which heavy throttling engages.
    #[serde(default = "default_heavy_anomaly")]
    pub heavy_score: f64,

    /// Anomaly score at or above which emergency throttling engages.
    #[serde(default = "default_emergency_anomaly")]
    pub emergency_score: f64,

    /// Requests observed before a profile is trusted for scoring.
    #[serde(default = "default_min_observations")]
    pub min_observations: u64,
}

impl Default for BehaviorTuning {
    fn default() -> Self {
        Self {
            ema_alpha: default_ema_alpha(),
            rate_weight: default_rate_weight(),
            volume_weight: default_volume_weight(),
            endpoint_weight: default_endpoint_weight(),
            hours_weight: default_hours_weight(),
            spacing_weight: default_spacing_weight(),
            rate_multiplier: default_rate_multiplier(),
            volume_multiplier: default_volume_multiplier(),
            light_score: default_light_anomaly(),
            moderate_score: default_moderate_anomaly(),
            heavy_score: default_heavy_anomaly(),
            emergency_score: default_emergency_anomaly(),
            min_observations: default_min_observations(),
        }
    }
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_rate_weight() -> f64 {
    0.30
}

fn default_volume_weight() -> f64 {
    0.20
}

fn default_endpoint_weight() -> f64 {
    0.20
}

fn default_hours_weight() -> f64 {
    0.15
}

fn default_spacing_weight() -> f64 {
    0.15
}

fn default_rate_multiplier() -> f64 {
    3.0
}

fn default_volume_multiplier() -> f64 {
    4.0
}

fn default_light_anomaly() -> f64 {
    0.5
}

fn default_moderate_anomaly() -> f64 {
    0.65
}

fn default_heavy_anomaly() -> f64 {
    0.8
}

fn default_emergency_anomaly() -> f64 {
    0.9
}

fn default_min_observations() -> u64 {
    20
}

/// All strategy tuning grouped under `throttle.tuning`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleTuning {
    /// Adaptive strategy knobs.
    #[serde(default)]
    pub adaptive: AdaptiveTuning,

    /// Predictive strategy knobs.
    #[serde(default)]
    pub predictive: PredictiveTuning,

    /// Behavioral strategy knobs.
    #[serde(default)]
    pub behavior: BehaviorTuning,
}

/// An event-driven cache invalidation rule.
///
/// When a queued invalidation event's kind matches `trigger`, the rule's
/// scope is resolved and applied. Tag and pattern values may contain the
/// placeholder `{resource}`, replaced by the event's resource identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationRuleConfig {
    /// Unique rule identifier.
    pub id: String,

    /// Event kind this rule reacts to, e.g. `credential.rotated`.
    pub trigger: String,

    /// Tags to invalidate; supports `{resource}`.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Request path pattern to invalidate; supports `{resource}` and glob
    /// `*`.
    #[serde(default)]
    pub pattern: Option<String>,

    /// Route whose entries are invalidated wholesale.
    #[serde(default)]
    pub route: Option<String>,

    /// Invalidate everything. Overrides the narrower scopes.
    #[serde(default)]
    pub flush_all: bool,

    /// Disabled rules are kept but never matched.
    #[serde(default = "default_true")]
    pub enabled: bool,
}
