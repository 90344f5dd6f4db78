//! # Relay Cache
//!
//! Response caching for the relay gateway:
//!
//! - deterministic cache keys hashed from the request identity plus any
//!   configured vary headers
//! - a TTL-bound in-memory store with tag and route indices
//! - invalidation by key, path pattern, tag, route, or everything at once
//! - an event queue that maps operational events (credential rotations,
//!   deploys) onto configured invalidation rules

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod invalidation;
mod key;
mod store;

pub use error::CacheError;
pub use invalidation::{InvalidationEvent, InvalidationManager, InvalidationWorker};
pub use key::cache_key;
pub use store::{CacheStats, CachedResponse, ResponseCache};
