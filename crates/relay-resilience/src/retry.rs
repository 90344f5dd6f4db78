//! Retry policy with backoff and jitter.
//!
//! The policy only computes decisions and delays; the pipeline owns the
//! retry loop so that each attempt's outcome also reaches the circuit
//! breaker. Retries are reserved for idempotent requests failing with a
//! retryable class; client errors are never retried.

use std::time::Duration;

use rand::Rng;

use relay_core::FailureClass;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay multiplied per retry.
    #[default]
    Exponential,
}

/// Retry policy for one route.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries permitted after the initial attempt.
    pub max_retries: u32,
    /// Delay growth strategy.
    pub strategy: BackoffStrategy,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on any delay, applied after jitter.
    pub max_delay: Duration,
    /// Growth factor for [`BackoffStrategy::Exponential`].
    pub multiplier: f64,
    /// Jitter fraction in `[0, 1]`; each delay is scaled by a random factor
    /// in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Whether another attempt should be made after `completed_attempts`
    /// (including the initial call) ended with `class`.
    #[must_use]
    pub fn should_retry(
        &self,
        completed_attempts: u32,
        idempotent: bool,
        class: FailureClass,
    ) -> bool {
        idempotent && class.is_retryable() && completed_attempts <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based), with jitter from the
    /// thread-local RNG.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.delay_for_retry_with(retry, &mut rand::thread_rng())
    }

    /// Delay before retry number `retry` (1-based) using an explicit RNG,
    /// letting tests pin the jitter.
    #[must_use]
    pub fn delay_for_retry_with<R: Rng>(&self, retry: u32, rng: &mut R) -> Duration {
        let retry = retry.max(1);
        let base = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let grown =
                    self.base_delay.as_secs_f64() * self.multiplier.powi(retry as i32 - 1);
                Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
            }
        };

        if self.jitter <= 0.0 {
            return base.min(self.max_delay);
        }
        let factor = rng.gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Duration::from_secs_f64(base.as_secs_f64() * factor).min(self.max_delay)
    }
}
