//! Per-route concurrency ceiling.
//!
//! A route with `max_concurrent_requests` set fast-fails once the ceiling is
//! reached: there is no queueing, because queued callers would still be
//! holding their own upstream deadlines. Permits release on drop, so every
//! exit path (success, failure, panic unwind) returns capacity.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::debug;

use relay_core::{RelayError, RouteId};

/// Fast-fail concurrency limiter for one route.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    route: RouteId,
    limit: u32,
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter admitting at most `limit` concurrent calls.
    #[must_use]
    pub fn new(route: RouteId, limit: u32) -> Self {
        Self {
            route,
            limit,
            semaphore: Arc::new(Semaphore::new(limit as usize)),
        }
    }

    /// Attempts to take a slot without waiting.
    pub fn try_acquire(&self) -> Result<ConcurrencyPermit, RelayError> {
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(ConcurrencyPermit { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => {
                debug!(route = %self.route, limit = self.limit, "concurrency ceiling reached");
                Err(RelayError::rate_limited(
                    format!("endpoint:{}", self.route),
                    Duration::from_secs(1),
                    format!("route concurrency ceiling ({}) reached", self.limit),
                ))
            }
        }
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Configured ceiling.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }
}

/// A held concurrency slot; dropping it releases the slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ceiling_fast_fails_and_drop_releases() {
        let limiter = ConcurrencyLimiter::new(RouteId::new("pay"), 2);

        let p1 = limiter.try_acquire().unwrap();
        let _p2 = limiter.try_acquire().unwrap();
        assert_eq!(limiter.available(), 0);

        let err = limiter.try_acquire().unwrap_err();
        assert_eq!(err.error_code(), "rate_limited");
        assert!(err.retry_after().is_some());

        drop(p1);
        assert_eq!(limiter.available(), 1);
        let _p3 = limiter.try_acquire().unwrap();
    }
}
