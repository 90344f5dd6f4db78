//! # Relay Routing
//!
//! Route table compilation and request matching.
//!
//! A [`RouteTable`] is built once per configuration snapshot: every route's
//! path pattern is compiled to a regex and its method list parsed, so the
//! per-request match is a linear scan over precompiled matchers ordered by
//! priority. Equal-priority matches are disambiguated by weighted random
//! selection.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod pattern;
pub mod table;

pub use pattern::PathPattern;
pub use table::{CompiledRoute, RouteTable, RoutingError};
