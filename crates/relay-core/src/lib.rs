//! # Relay Core
//!
//! Core types, identifiers, and error handling for the API relay gateway.
//!
//! This crate provides the foundational vocabulary used throughout the relay:
//! - Proxied request and response representations
//! - Identifier newtypes (routes, callers, tenants, requests)
//! - The error taxonomy surfaced to callers
//! - Failure classification and usage samples fed to the resilience layers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod ids;
pub mod request;
pub mod response;
pub mod usage;

// Re-export commonly used types
pub use error::{RelayError, RelayResult};
pub use ids::{CallerId, RequestId, RouteId, TenantId};
pub use request::ProxyRequest;
pub use response::{CacheStatus, ProxyResponse};
pub use usage::{FailureClass, UsageSample};
