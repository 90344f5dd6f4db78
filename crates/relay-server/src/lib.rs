//! HTTP surface of the relay gateway.
//!
//! Two surfaces share one listener. The relay surface is the router's
//! fallback: any path outside the reserved prefixes is matched against
//! the route table and forwarded through the pipeline, with the verdict
//! stamped into `X-Cache`, `X-Proxied-By`, and `X-Proxy-Request-ID`.
//! The control surface lives under `/proxy` (health, stats, reload,
//! breaker overrides, cache invalidation) next to the bare `/livez` and
//! `/readyz` probes.
//!
//! [`serve`] runs the whole thing with signal-driven graceful shutdown;
//! [`router`] is exposed separately for embedding and tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod extractors;
mod handlers;
mod routes;
mod server;
mod shutdown;
mod state;

pub use error::ApiError;
pub use routes::router;
pub use server::{serve, ServerError};
pub use shutdown::shutdown_signal;
pub use state::AppState;
