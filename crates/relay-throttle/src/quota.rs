//! Fixed-window quota counters.
//!
//! Each scope key gets an independent window: the first request opens it,
//! subsequent requests count against it, and once `limit` is reached the
//! remainder of the window rejects with the time left as the retry hint.
//! The next window starts clean. Counters only advance on admitted
//! requests, so a rejected burst does not eat into the following window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relay_resilience::Clock;

use crate::decision::QuotaStanding;

#[derive(Debug)]
struct WindowSlot {
    started: Instant,
    count: u64,
}

/// Outcome of charging one request against a quota.
#[derive(Debug)]
pub enum QuotaCharge {
    /// Admitted; standing reflects the charge just taken.
    Admitted(QuotaStanding),
    /// Rejected; the window resets after the contained duration.
    Exhausted {
        /// Standing with zero remaining.
        standing: QuotaStanding,
    },
}

/// Tracks fixed windows per scope key.
#[derive(Debug)]
pub struct QuotaTracker {
    clock: Arc<dyn Clock>,
    windows: DashMap<String, WindowSlot>,
}

impl QuotaTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
        }
    }

    /// Charges one request against `key`'s window.
    pub fn charge(&self, key: &str, limit: u64, window: Duration) -> QuotaCharge {
        let now = self.clock.now();
        let mut slot = self.windows.entry(key.to_owned()).or_insert(WindowSlot {
            started: now,
            count: 0,
        });

        // Window elapsed: start a fresh one.
        if now.duration_since(slot.started) >= window {
            slot.started = now;
            slot.count = 0;
        }

        let reset_after = window.saturating_sub(now.duration_since(slot.started));
        if slot.count < limit {
            slot.count += 1;
            QuotaCharge::Admitted(QuotaStanding {
                scope: key.to_owned(),
                limit,
                remaining: limit - slot.count,
                reset_after,
            })
        } else {
            QuotaCharge::Exhausted {
                standing: QuotaStanding {
                    scope: key.to_owned(),
                    limit,
                    remaining: 0,
                    reset_after,
                },
            }
        }
    }

    /// Drops windows that ended more than one window length ago, so idle
    /// scopes do not accumulate. Called from the periodic maintenance task.
    pub fn prune(&self, max_window: Duration) {
        let now = self.clock.now();
        self.windows
            .retain(|_, slot| now.duration_since(slot.started) < max_window * 2);
    }

    /// Active window count, for stats.
    #[must_use]
    pub fn active_windows(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_resilience::ManualClock;

    fn tracker() -> (Arc<ManualClock>, QuotaTracker) {
        let clock = Arc::new(ManualClock::new());
        let tracker = QuotaTracker::new(clock.clone());
        (clock, tracker)
    }

    #[test]
    fn eleventh_request_in_window_rejects() {
        let (_clock, tracker) = tracker();
        let window = Duration::from_secs(60);

        for i in 0..10 {
            match tracker.charge("user:alice", 10, window) {
                QuotaCharge::Admitted(standing) => {
                    assert_eq!(standing.remaining, 9 - i);
                }
                QuotaCharge::Exhausted { .. } => panic!("request {i} should be admitted"),
            }
        }

        match tracker.charge("user:alice", 10, window) {
            QuotaCharge::Exhausted { standing } => {
                assert_eq!(standing.remaining, 0);
                assert!(standing.reset_after > Duration::ZERO);
                assert!(standing.reset_after <= window);
            }
            QuotaCharge::Admitted(_) => panic!("should be exhausted"),
        }
    }

    #[test]
    fn next_window_admits_again() {
        let (clock, tracker) = tracker();
        let window = Duration::from_secs(60);

        for _ in 0..10 {
            tracker.charge("user:alice", 10, window);
        }
        assert!(matches!(
            tracker.charge("user:alice", 10, window),
            QuotaCharge::Exhausted { .. }
        ));

        clock.advance(Duration::from_secs(60));
        assert!(matches!(
            tracker.charge("user:alice", 10, window),
            QuotaCharge::Admitted(_)
        ));
    }

    #[test]
    fn scopes_count_independently() {
        let (_clock, tracker) = tracker();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            tracker.charge("user:alice", 3, window);
        }
        assert!(matches!(
            tracker.charge("user:alice", 3, window),
            QuotaCharge::Exhausted { .. }
        ));
        assert!(matches!(
            tracker.charge("user:bob", 3, window),
            QuotaCharge::Admitted(_)
        ));
    }

    #[test]
    fn prune_drops_stale_windows() {
        let (clock, tracker) = tracker();
        tracker.charge("user:alice", 10, Duration::from_secs(60));
        assert_eq!(tracker.active_windows(), 1);

        clock.advance(Duration::from_secs(121));
        tracker.prune(Duration::from_secs(60));
        assert_eq!(tracker.active_windows(), 0);
    }
}
