//! Integration tests for the API relay gateway
//!
//! Each scenario boots the real router on an ephemeral port and relays
//! against wiremock upstreams, covering:
//! - Request relay, credential injection and retry
//! - Circuit breaker trips, recovery and admin overrides
//! - Quota and concurrency admission
//! - Response caching and invalidation
//! - Hot reload and the stats surface

pub mod helpers;
pub mod upstream;

pub use helpers::*;
pub use upstream::*;

#[cfg(test)]
mod admin_tests;
#[cfg(test)]
mod breaker_tests;
#[cfg(test)]
mod cache_tests;
#[cfg(test)]
mod relay_tests;
#[cfg(test)]
mod throttle_tests;
