//! Request outcome accounting.
//!
//! The recorder is the gateway's ledger of what happened to each request:
//! relayed, served from cache, throttled, short-circuited, or failed. It is
//! all atomics, so recording costs nothing measurable on the hot path. The
//! stats endpoint combines a [`GatewayStats`] snapshot with the per-component
//! snapshots (cache, breakers, throttle) that own their own counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use relay_core::{CacheStatus, ProxyResponse, RelayError, RouteId};

/// Counters for one route.
#[derive(Debug, Default)]
struct RouteCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
}

/// Atomic request-outcome ledger.
#[derive(Debug)]
pub struct StatsRecorder {
    started: Instant,
    started_at: DateTime<Utc>,
    total: AtomicU64,
    relayed: AtomicU64,
    cache_hits: AtomicU64,
    throttled: AtomicU64,
    breaker_rejections: AtomicU64,
    upstream_failures: AtomicU64,
    unmatched: AtomicU64,
    internal_errors: AtomicU64,
    latency_micros: AtomicU64,
    latency_samples: AtomicU64,
    routes: DashMap<RouteId, RouteCounters>,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecorder {
    /// Creates an empty recorder; uptime counts from here.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            total: AtomicU64::new(0),
            relayed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            breaker_rejections: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
            unmatched: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            routes: DashMap::new(),
        }
    }

    /// Records a response delivered to the caller, cached or relayed.
    pub fn record_response(&self, route: &RouteId, response: &ProxyResponse) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.relayed.fetch_add(1, Ordering::Relaxed);

        let counters = self.routes.entry(route.clone()).or_default();
        counters.requests.fetch_add(1, Ordering::Relaxed);

        if response.cache == CacheStatus::Hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(latency) = response.upstream_latency {
            let micros = latency.as_micros() as u64;
            self.latency_micros.fetch_add(micros, Ordering::Relaxed);
            self.latency_samples.fetch_add(1, Ordering::Relaxed);
            counters.latency_micros.fetch_add(micros, Ordering::Relaxed);
            counters.latency_samples.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a request that never produced an upstream response.
    pub fn record_failure(&self, route: Option<&RouteId>, error: &RelayError) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match error {
            RelayError::RouteNotFound { .. } => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::RateLimited { .. } => {
                self.throttled.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::CircuitOpen { .. } => {
                self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::UpstreamTimeout { .. }
            | RelayError::UpstreamError { .. }
            | RelayError::UpstreamUnavailable { .. }
            | RelayError::NoHealthyCredential { .. } => {
                self.upstream_failures.fetch_add(1, Ordering::Relaxed);
            }
            RelayError::Internal { .. } => {
                self.internal_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        if let Some(route) = route {
            let counters = self.routes.entry(route.clone()).or_default();
            counters.requests.fetch_add(1, Ordering::Relaxed);
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Time since the recorder was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Cumulative upstream latency as `(micros, samples)`. Samplers diff two
    /// readings to get a per-interval mean without walking the route map.
    #[must_use]
    pub fn upstream_latency_totals(&self) -> (u64, u64) {
        (
            self.latency_micros.load(Ordering::Relaxed),
            self.latency_samples.load(Ordering::Relaxed),
        )
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> GatewayStats {
        let uptime = self.uptime();
        let total = self.total.load(Ordering::Relaxed);

        let routes = self
            .routes
            .iter()
            .map(|entry| {
                let samples = entry.latency_samples.load(Ordering::Relaxed);
                let avg_upstream_latency_ms = if samples == 0 {
                    None
                } else {
                    let micros = entry.latency_micros.load(Ordering::Relaxed);
                    Some(micros as f64 / samples as f64 / 1000.0)
                };
                (
                    entry.key().as_str().to_owned(),
                    RouteStats {
                        requests: entry.requests.load(Ordering::Relaxed),
                        failures: entry.failures.load(Ordering::Relaxed),
                        cache_hits: entry.cache_hits.load(Ordering::Relaxed),
                        avg_upstream_latency_ms,
                    },
                )
            })
            .collect();

        let (latency_micros, latency_samples) = self.upstream_latency_totals();
        let avg_upstream_latency_ms = if latency_samples == 0 {
            None
        } else {
            Some(latency_micros as f64 / latency_samples as f64 / 1000.0)
        };

        GatewayStats {
            started_at: self.started_at,
            uptime_seconds: uptime.as_secs(),
            total_requests: total,
            relayed: self.relayed.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            internal_errors: self.internal_errors.load(Ordering::Relaxed),
            requests_per_second: total as f64 / uptime.as_secs_f64().max(1.0),
            avg_upstream_latency_ms,
            routes,
        }
    }
}

/// Serializable counter snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    /// Process start time.
    pub started_at: DateTime<Utc>,
    /// Whole seconds since start.
    pub uptime_seconds: u64,
    /// Requests seen, whatever their outcome.
    pub total_requests: u64,
    /// Responses delivered to callers, cached or relayed.
    pub relayed: u64,
    /// Responses served from the cache.
    pub cache_hits: u64,
    /// Requests rejected by admission control.
    pub throttled: u64,
    /// Requests short-circuited by an open breaker.
    pub breaker_rejections: u64,
    /// Requests that died on the upstream leg.
    pub upstream_failures: u64,
    /// Requests that matched no route.
    pub unmatched: u64,
    /// Requests lost to internal pipeline errors.
    pub internal_errors: u64,
    /// Requests per second averaged over the whole uptime.
    pub requests_per_second: f64,
    /// Mean upstream latency in milliseconds across all routes, absent
    /// before the first relayed response.
    pub avg_upstream_latency_ms: Option<f64>,
    /// Per-route counters, keyed by route id.
    pub routes: BTreeMap<String, RouteStats>,
}

/// Per-route slice of [`GatewayStats`].
#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    /// Requests attributed to the route.
    pub requests: u64,
    /// Requests that failed on the route.
    pub failures: u64,
    /// Cache hits served for the route.
    pub cache_hits: u64,
    /// Mean upstream latency in milliseconds, absent before the first
    /// relayed response.
    pub avg_upstream_latency_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use bytes::Bytes;
    use http::{HeaderMap, StatusCode};

    fn relayed(latency_ms: u64) -> ProxyResponse {
        ProxyResponse::upstream(
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::new(),
            Duration::from_millis(latency_ms),
        )
    }

    #[test]
    fn outcomes_land_in_their_counters() {
        let recorder = StatsRecorder::new();
        let route = RouteId::new("llm-chat");

        recorder.record_response(&route, &relayed(40));
        recorder.record_response(
            &route,
            &ProxyResponse::cached(StatusCode::OK, HeaderMap::new(), Bytes::new()),
        );
        recorder.record_failure(
            Some(&route),
            &RelayError::circuit_open(route.clone(), None),
        );
        recorder.record_failure(
            None,
            &RelayError::rate_limited("user:a", Duration::from_secs(30), "quota"),
        );
        recorder.record_failure(None, &RelayError::route_not_found("GET", "/nope"));

        let stats = recorder.snapshot();
        assert_eq!(stats.total_requests, 5);
        assert_eq!(stats.relayed, 2);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.breaker_rejections, 1);
        assert_eq!(stats.throttled, 1);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.upstream_failures, 0);

        let per_route = &stats.routes["llm-chat"];
        assert_eq!(per_route.requests, 3);
        assert_eq!(per_route.failures, 1);
        assert_eq!(per_route.cache_hits, 1);
    }

    #[test]
    fn latency_average_covers_only_upstream_legs() {
        let recorder = StatsRecorder::new();
        let route = RouteId::new("ocr-scan");

        recorder.record_response(&route, &relayed(30));
        recorder.record_response(&route, &relayed(50));
        // A cache hit carries no upstream latency and must not skew the mean.
        recorder.record_response(
            &route,
            &ProxyResponse::cached(StatusCode::OK, HeaderMap::new(), Bytes::new()),
        );

        let stats = recorder.snapshot();
        let avg = stats.routes["ocr-scan"]
            .avg_upstream_latency_ms
            .expect("two samples");
        assert!((avg - 40.0).abs() < 1e-6);

        let global = stats.avg_upstream_latency_ms.expect("two samples");
        assert!((global - 40.0).abs() < 1e-6);
        assert_eq!(recorder.upstream_latency_totals(), (80_000, 2));
    }

    #[test]
    fn untouched_route_reports_no_latency() {
        let recorder = StatsRecorder::new();
        let route = RouteId::new("pay");
        recorder.record_failure(Some(&route), &RelayError::internal("boom"));

        let stats = recorder.snapshot();
        assert_eq!(stats.internal_errors, 1);
        assert!(stats.routes["pay"].avg_upstream_latency_ms.is_none());
    }
}
