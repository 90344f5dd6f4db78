//! Per-route circuit breaker.
//!
//! Protects an upstream by refusing calls once it is judged unhealthy.
//! Closed is the normal state; Open short-circuits every call; HalfOpen
//! admits a bounded number of probes whose outcomes decide between closing
//! again and reopening.
//!
//! Three independent triggers open a closed breaker:
//! - a run of consecutive failures,
//! - the failure ratio over the sliding window (given enough samples),
//! - the mean latency over the sliding window (given enough samples).
//!
//! When and how an open breaker starts probing is governed by its
//! [`RecoveryStrategy`]. All timing goes through the injected [`Clock`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use relay_core::{RelayError, RouteId};

use crate::clock::Clock;

/// Latency used to normalize the health score when no explicit latency
/// threshold is configured.
const DEFAULT_LATENCY_REFERENCE: Duration = Duration::from_secs(1);

/// Transitions retained per breaker for diagnostics.
const TRANSITION_HISTORY_CAPACITY: usize = 32;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed = 0,
    /// Upstream judged unhealthy, calls are short-circuited.
    Open = 1,
    /// Probing: a bounded number of trial calls are admitted.
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl CircuitState {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategy deciding when an open breaker is allowed to probe.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStrategy {
    /// Probe on the next call.
    Immediate,
    /// Probe after a fixed cool-down.
    FixedTimeout {
        /// Cool-down before probing.
        timeout: Duration,
    },
    /// Cool-down grows with each failed recovery attempt, capped.
    ExponentialBackoff {
        /// Initial cool-down.
        min_timeout: Duration,
        /// Cool-down ceiling.
        max_timeout: Duration,
        /// Growth per failed recovery attempt.
        multiplier: f64,
    },
    /// Probe once windowed health clears `health_threshold` and at least
    /// `min_timeout` has elapsed since opening.
    Adaptive {
        /// Minimum cool-down regardless of health.
        min_timeout: Duration,
        /// Health score in `(0, 1]` required to probe.
        health_threshold: f64,
    },
}

impl Default for RecoveryStrategy {
    fn default() -> Self {
        Self::FixedTimeout {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Runtime circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it.
    pub success_threshold: u32,
    /// Windowed failure ratio in `(0, 1]` that trips the breaker.
    pub failure_rate_threshold: f64,
    /// Samples required before ratio and latency triggers apply.
    pub min_samples: u32,
    /// Mean windowed latency that trips the breaker, if set.
    pub avg_latency_threshold: Option<Duration>,
    /// Sliding window capacity in samples.
    pub window_size: usize,
    /// Concurrent probe ceiling while half-open.
    pub half_open_max_probes: u32,
    /// Recovery strategy.
    pub recovery: RecoveryStrategy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            failure_rate_threshold: 0.5,
            min_samples: 10,
            avg_latency_threshold: None,
            window_size: 100,
            half_open_max_probes: 3,
            recovery: RecoveryStrategy::default(),
        }
    }
}

/// One recorded state transition.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionRecord {
    /// State before.
    pub from: CircuitState,
    /// State after.
    pub to: CircuitState,
    /// Wall-clock transition time.
    pub at: DateTime<Utc>,
    /// What caused the transition.
    pub reason: String,
}

/// Point-in-time view of a breaker, serialized on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    /// Route this breaker guards.
    pub route: RouteId,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed while closed.
    pub consecutive_failures: u32,
    /// Samples currently in the window.
    pub window_samples: usize,
    /// Failure ratio over the window, 0 when empty.
    pub window_failure_rate: f64,
    /// Mean latency over the window in milliseconds, 0 when empty.
    pub window_avg_latency_ms: f64,
    /// Windowed health score in `[0, 1]`.
    pub health_score: f64,
    /// Calls recorded since creation or reset.
    pub total_calls: u64,
    /// Failures recorded since creation or reset.
    pub total_failures: u64,
    /// Calls refused without reaching the upstream.
    pub total_short_circuits: u64,
    /// Failed recovery attempts since the breaker last opened.
    pub recovery_attempts: u32,
    /// Seconds since the breaker opened, while open.
    pub open_for_secs: Option<f64>,
    /// Whether the breaker was forced open by an operator.
    pub forced_open: bool,
    /// Recent transitions, oldest first.
    pub transitions: Vec<TransitionRecord>,
}

#[derive(Debug, Clone, Copy)]
struct OutcomeSample {
    success: bool,
    latency: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    window: VecDeque<OutcomeSample>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_inflight: u32,
    recovery_attempts: u32,
    opened_at: Option<Instant>,
    forced_open: bool,
    total_calls: u64,
    total_failures: u64,
    total_short_circuits: u64,
    history: VecDeque<TransitionRecord>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_inflight: 0,
            recovery_attempts: 0,
            opened_at: None,
            forced_open: false,
            total_calls: 0,
            total_failures: 0,
            total_short_circuits: 0,
            history: VecDeque::new(),
        }
    }

    fn push_sample(&mut self, sample: OutcomeSample, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);
    }

    fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.success).count();
        failures as f64 / self.window.len() as f64
    }

    fn avg_latency(&self) -> Duration {
        if self.window.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.window.iter().map(|s| s.latency).sum();
        total / self.window.len() as u32
    }
}

/// A circuit breaker guarding one route's upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    route: RouteId,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(route: RouteId, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            route,
            config,
            clock,
            state: AtomicU8::new(CircuitState::Closed as u8),
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    /// Route this breaker guards.
    #[must_use]
    pub fn route(&self) -> &RouteId {
        &self.route
    }

    /// Configuration this breaker was built with.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Decides whether a call may proceed right now.
    ///
    /// While open, this is where recovery eligibility is evaluated: an
    /// eligible breaker transitions to half-open and admits the caller as
    /// the first probe. Rejections include a retry hint when the remaining
    /// cool-down is known.
    pub fn try_acquire(&self) -> Result<(), RelayError> {
        match self.state() {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let mut inner = self.inner.lock();
                // Re-read under the lock; another caller may have already
                // transitioned the breaker.
                match CircuitState::from(self.state.load(Ordering::SeqCst)) {
                    CircuitState::Closed => Ok(()),
                    CircuitState::HalfOpen => self.admit_probe(&mut inner),
                    CircuitState::Open => {
                        if !inner.forced_open && self.probe_eligible(&inner) {
                            self.transition(&mut inner, CircuitState::HalfOpen, "cool-down elapsed");
                            self.admit_probe(&mut inner)
                        } else {
                            inner.total_short_circuits += 1;
                            Err(RelayError::circuit_open(
                                self.route.clone(),
                                self.retry_hint(&inner),
                            ))
                        }
                    }
                }
            }
            CircuitState::HalfOpen => {
                let mut inner = self.inner.lock();
                self.admit_probe(&mut inner)
            }
        }
    }

    fn admit_probe(&self, inner: &mut BreakerInner) -> Result<(), RelayError> {
        if inner.half_open_inflight < self.config.half_open_max_probes {
            inner.half_open_inflight += 1;
            debug!(route = %self.route, inflight = inner.half_open_inflight, "admitting probe");
            Ok(())
        } else {
            inner.total_short_circuits += 1;
            Err(RelayError::circuit_open(self.route.clone(), None))
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.push_sample(
            OutcomeSample {
                success: true,
                latency,
            },
            self.config.window_size,
        );

        match CircuitState::from(self.state.load(Ordering::SeqCst)) {
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.consecutive_failures = 0;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed, "probes succeeded");
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                // Slow successes can still trip the latency trigger.
                if let Some(reason) = self.closed_trip_reason(&inner, false) {
                    self.open(&mut inner, &reason);
                }
            }
            CircuitState::Open => {
                // Late result from a call admitted before opening.
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.push_sample(
            OutcomeSample {
                success: false,
                latency,
            },
            self.config.window_size,
        );

        match CircuitState::from(self.state.load(Ordering::SeqCst)) {
            CircuitState::HalfOpen => {
                inner.half_open_inflight = inner.half_open_inflight.saturating_sub(1);
                inner.consecutive_successes = 0;
                inner.recovery_attempts += 1;
                self.open(&mut inner, "probe failed");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if let Some(reason) = self.closed_trip_reason(&inner, true) {
                    self.open(&mut inner, &reason);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker open until an operator closes or resets it.
    /// Automatic recovery is suspended while forced.
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = true;
        if self.state() != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open, "forced open");
            inner.opened_at = Some(self.clock.now());
        }
        warn!(route = %self.route, "breaker forced open");
    }

    /// Forces the breaker closed, clearing any forced-open hold.
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = false;
        if self.state() != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, "forced closed");
        }
        info!(route = %self.route, "breaker forced closed");
    }

    /// Resets the breaker to a fresh closed state, clearing counters and the
    /// window. The transition history is retained so the reset is visible.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.forced_open = false;
        let from = self.state();
        if from != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed, "reset");
        } else {
            inner.history.push_back(TransitionRecord {
                from,
                to: CircuitState::Closed,
                at: Utc::now(),
                reason: "reset".to_owned(),
            });
            if inner.history.len() > TRANSITION_HISTORY_CAPACITY {
                inner.history.pop_front();
            }
        }
        inner.window.clear();
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.recovery_attempts = 0;
        inner.total_calls = 0;
        inner.total_failures = 0;
        inner.total_short_circuits = 0;
        info!(route = %self.route, "breaker reset");
    }

    /// Point-in-time snapshot for the admin surface.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        let state = self.state();
        BreakerSnapshot {
            route: self.route.clone(),
            state,
            consecutive_failures: inner.consecutive_failures,
            window_samples: inner.window.len(),
            window_failure_rate: inner.failure_rate(),
            window_avg_latency_ms: inner.avg_latency().as_secs_f64() * 1000.0,
            health_score: self.health_score_locked(&inner),
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_short_circuits: inner.total_short_circuits,
            recovery_attempts: inner.recovery_attempts,
            open_for_secs: inner
                .opened_at
                .filter(|_| state == CircuitState::Open)
                .map(|at| (self.clock.now() - at).as_secs_f64()),
            forced_open: inner.forced_open,
            transitions: inner.history.iter().cloned().collect(),
        }
    }

    /// Windowed health score in `[0, 1]`.
    ///
    /// `0.7 * success_rate + 0.3 * (1 - normalized_latency)`, where latency
    /// is normalized against the configured latency threshold (or one second
    /// when none is set) and clamped to `[0, 1]`.
    #[must_use]
    pub fn health_score(&self) -> f64 {
        let inner = self.inner.lock();
        self.health_score_locked(&inner)
    }

    fn health_score_locked(&self, inner: &BreakerInner) -> f64 {
        if inner.window.is_empty() {
            return 1.0;
        }
        let success_rate = 1.0 - inner.failure_rate();
        let reference = self
            .config
            .avg_latency_threshold
            .unwrap_or(DEFAULT_LATENCY_REFERENCE);
        let normalized_latency =
            (inner.avg_latency().as_secs_f64() / reference.as_secs_f64()).clamp(0.0, 1.0);
        (0.7 * success_rate + 0.3 * (1.0 - normalized_latency)).clamp(0.0, 1.0)
    }

    fn closed_trip_reason(&self, inner: &BreakerInner, failure: bool) -> Option<String> {
        if failure && inner.consecutive_failures >= self.config.failure_threshold {
            return Some(format!(
                "{} consecutive failures",
                inner.consecutive_failures
            ));
        }
        if inner.window.len() >= self.config.min_samples as usize {
            let rate = inner.failure_rate();
            if rate >= self.config.failure_rate_threshold {
                return Some(format!("window failure rate {rate:.2}"));
            }
            if let Some(threshold) = self.config.avg_latency_threshold {
                let avg = inner.avg_latency();
                if avg >= threshold {
                    return Some(format!("window avg latency {}ms", avg.as_millis()));
                }
            }
        }
        None
    }

    fn open(&self, inner: &mut BreakerInner, reason: &str) {
        self.transition(inner, CircuitState::Open, reason);
        inner.opened_at = Some(self.clock.now());
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, reason: &str) {
        let from = self.state();
        if from == to {
            return;
        }
        self.state.store(to as u8, Ordering::SeqCst);

        match to {
            CircuitState::Closed => {
                inner.window.clear();
                inner.consecutive_failures = 0;
                inner.consecutive_successes = 0;
                inner.recovery_attempts = 0;
                inner.half_open_inflight = 0;
                inner.opened_at = None;
            }
            CircuitState::Open => {
                inner.consecutive_successes = 0;
                inner.half_open_inflight = 0;
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes = 0;
                inner.half_open_inflight = 0;
            }
        }

        inner.history.push_back(TransitionRecord {
            from,
            to,
            at: Utc::now(),
            reason: reason.to_owned(),
        });
        if inner.history.len() > TRANSITION_HISTORY_CAPACITY {
            inner.history.pop_front();
        }

        info!(
            route = %self.route,
            from = %from,
            to = %to,
            reason,
            "breaker transition"
        );
    }

    fn probe_eligible(&self, inner: &BreakerInner) -> bool {
        let Some(opened_at) = inner.opened_at else {
            return true;
        };
        let elapsed = self.clock.now() - opened_at;
        match &self.config.recovery {
            RecoveryStrategy::Immediate => true,
            RecoveryStrategy::FixedTimeout { timeout } => elapsed >= *timeout,
            RecoveryStrategy::ExponentialBackoff { .. } => {
                elapsed >= self.backoff_cooldown(inner.recovery_attempts)
            }
            RecoveryStrategy::Adaptive {
                min_timeout,
                health_threshold,
            } => elapsed >= *min_timeout && self.health_score_locked(inner) > *health_threshold,
        }
    }

    fn backoff_cooldown(&self, attempts: u32) -> Duration {
        match &self.config.recovery {
            RecoveryStrategy::ExponentialBackoff {
                min_timeout,
                max_timeout,
                multiplier,
            } => {
                let grown = min_timeout.as_secs_f64() * multiplier.powi(attempts as i32);
                Duration::from_secs_f64(grown.min(max_timeout.as_secs_f64()))
            }
            _ => Duration::ZERO,
        }
    }

    fn retry_hint(&self, inner: &BreakerInner) -> Option<Duration> {
        if inner.forced_open {
            return None;
        }
        let opened_at = inner.opened_at?;
        let elapsed = self.clock.now() - opened_at;
        let cooldown = match &self.config.recovery {
            RecoveryStrategy::Immediate => return None,
            RecoveryStrategy::FixedTimeout { timeout } => *timeout,
            RecoveryStrategy::ExponentialBackoff { .. } => {
                self.backoff_cooldown(inner.recovery_attempts)
            }
            RecoveryStrategy::Adaptive { min_timeout, .. } => *min_timeout,
        };
        cooldown.checked_sub(elapsed)
    }
}
