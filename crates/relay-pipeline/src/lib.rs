//! # Relay Pipeline
//!
//! Wires the relay stages into one request path: route matching, throttle
//! admission, concurrency ceilings, response caching, circuit breaking,
//! and the upstream HTTP call with retry. The [`Pipeline`] owns the
//! long-lived engines and an atomically swappable configuration snapshot,
//! so operators can reload routes without dropping breaker or quota state.
//!
//! The upstream side is abstracted behind [`UpstreamTransport`];
//! production uses [`HttpTransport`], tests script replies directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod credentials;
mod error;
mod headers;
mod pipeline;
mod transport;
mod usage;

pub use credentials::CredentialStore;
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineWorkers};
pub use transport::{
    HttpTransport, TransportError, UpstreamCall, UpstreamReply, UpstreamTransport,
};
pub use usage::{LogUsageSink, UsagePump, UsageReporter, UsageSink};
