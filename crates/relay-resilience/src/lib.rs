//! # Relay Resilience
//!
//! Resilience primitives for the API relay gateway:
//! - Per-route circuit breakers with windowed triggers and pluggable
//!   recovery strategies
//! - A registry keeping breaker state across configuration reloads
//! - Retry policies with backoff and jitter
//! - Fast-fail per-route concurrency ceilings
//!
//! Time is injected through [`Clock`] so breaker behavior is testable
//! without sleeping.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod clock;
pub mod concurrency;
pub mod registry;
pub mod retry;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, RecoveryStrategy,
    TransitionRecord,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::{ConcurrencyLimiter, ConcurrencyPermit};
pub use registry::BreakerRegistry;
pub use retry::{BackoffStrategy, RetryPolicy};
