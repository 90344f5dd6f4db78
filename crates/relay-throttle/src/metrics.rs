//! System metrics feed consumed by the adaptive strategies.
//!
//! The gateway does not measure system load itself; an external collector
//! (or the telemetry aggregator) implements [`MetricsFeed`]. When the feed
//! has nothing fresh to offer, every adaptive strategy stands down and only
//! static quotas and rules apply.

use std::time::Duration;

use parking_lot::RwLock;

/// One observation of overall system and upstream health.
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    /// Mean upstream response time over the collection interval.
    pub avg_response_time: Duration,
    /// Requests per second over the collection interval.
    pub requests_per_second: f64,
    /// Error ratio in `[0, 1]`.
    pub error_rate: f64,
    /// Resource utilization in `[0, 1]`.
    pub resource_utilization: f64,
    /// Response time considered healthy, for normalization.
    pub baseline_response_time: Duration,
    /// Throughput considered normal, for normalization.
    pub baseline_throughput: f64,
    /// Upstream cost accumulation rate, in deployment-defined units, when
    /// the collector tracks cost at all.
    pub cost_rate: Option<f64>,
    /// Age of this observation.
    pub age: Duration,
}

/// Source of [`SystemMetrics`] observations.
pub trait MetricsFeed: Send + Sync + std::fmt::Debug {
    /// Latest observation, or `None` when the feed has no data.
    ///
    /// Staleness is judged by the caller against the observation's `age`;
    /// feeds should still report old observations rather than guess.
    fn current(&self) -> Option<SystemMetrics>;
}

/// A feed with no data. Adaptive throttling is inert behind it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetricsFeed;

impl MetricsFeed for NullMetricsFeed {
    fn current(&self) -> Option<SystemMetrics> {
        None
    }
}

/// A feed returning whatever was last stored into it. Used by tests and by
/// deployments that push collector output into the gateway.
#[derive(Debug, Default)]
pub struct SharedMetricsFeed {
    current: RwLock<Option<SystemMetrics>>,
}

impl SharedMetricsFeed {
    /// Creates an empty feed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the current observation.
    pub fn store(&self, metrics: SystemMetrics) {
        *self.current.write() = Some(metrics);
    }

    /// Clears the feed.
    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

impl MetricsFeed for SharedMetricsFeed {
    fn current(&self) -> Option<SystemMetrics> {
        self.current.read().clone()
    }
}

impl SystemMetrics {
    /// A healthy baseline observation, convenient as a test starting point.
    #[must_use]
    pub fn healthy() -> Self {
        Self {
            avg_response_time: Duration::from_millis(100),
            requests_per_second: 50.0,
            error_rate: 0.0,
            resource_utilization: 0.3,
            baseline_response_time: Duration::from_millis(100),
            baseline_throughput: 50.0,
            cost_rate: None,
            age: Duration::ZERO,
        }
    }
}
