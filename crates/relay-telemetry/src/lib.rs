//! # Relay Telemetry
//!
//! Process-wide logging setup and the atomic request-outcome ledger behind
//! the health and stats endpoints.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod logging;
mod stats;

pub use logging::{init_logging, TelemetryError};
pub use stats::{GatewayStats, RouteStats, StatsRecorder};
