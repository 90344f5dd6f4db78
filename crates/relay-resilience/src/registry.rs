//! Registry of per-route circuit breakers.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use relay_core::RouteId;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
use crate::clock::Clock;

/// Owns one [`CircuitBreaker`] per guarded route.
///
/// Breaker state survives configuration reloads for routes whose breaker
/// thresholds did not change; a changed configuration replaces the breaker
/// with a fresh closed one.
#[derive(Debug)]
pub struct BreakerRegistry {
    clock: Arc<dyn Clock>,
    breakers: DashMap<RouteId, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates an empty registry sharing one clock across all breakers.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Looks up the breaker guarding `route`.
    #[must_use]
    pub fn breaker(&self, route: &RouteId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(route).map(|entry| entry.value().clone())
    }

    /// Returns the breaker for `route`, creating or replacing it so that it
    /// matches `config`.
    pub fn ensure(&self, route: RouteId, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(&route) {
            if existing.config() == &config {
                return existing.value().clone();
            }
        }
        let breaker = Arc::new(CircuitBreaker::new(route.clone(), config, self.clock.clone()));
        debug!(route = %route, "breaker (re)created");
        self.breakers.insert(route, breaker.clone());
        breaker
    }

    /// Aligns the registry with a configuration snapshot: breakers for
    /// departed routes are dropped, new and changed routes get fresh ones,
    /// unchanged routes keep their state.
    pub fn sync(&self, desired: &[(RouteId, CircuitBreakerConfig)]) {
        self.breakers
            .retain(|route, _| desired.iter().any(|(id, _)| id == route));
        for (route, config) in desired {
            self.ensure(route.clone(), config.clone());
        }
        info!(breakers = self.breakers.len(), "breaker registry synced");
    }

    /// Snapshots every breaker, sorted by route id for stable output.
    #[must_use]
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snaps: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        snaps.sort_by(|a, b| a.route.as_str().cmp(b.route.as_str()));
        snaps
    }

    /// Forces a route's breaker open. Returns `false` for unknown routes.
    pub fn force_open(&self, route: &RouteId) -> bool {
        self.with_breaker(route, CircuitBreaker::force_open)
    }

    /// Forces a route's breaker closed. Returns `false` for unknown routes.
    pub fn force_close(&self, route: &RouteId) -> bool {
        self.with_breaker(route, CircuitBreaker::force_close)
    }

    /// Resets a route's breaker. Returns `false` for unknown routes.
    pub fn reset(&self, route: &RouteId) -> bool {
        self.with_breaker(route, CircuitBreaker::reset)
    }

    fn with_breaker(&self, route: &RouteId, op: impl Fn(&CircuitBreaker)) -> bool {
        match self.breakers.get(route) {
            Some(entry) => {
                op(entry.value());
                true
            }
            None => false,
        }
    }
}
