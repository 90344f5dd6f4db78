//! Identifier newtypes shared across the relay.
//!
//! Identifiers are thin wrappers over their string (or UUID) form so that a
//! route id cannot be passed where a caller id is expected. All of them are
//! cheap to clone and hash; they are used as map keys throughout the
//! resilience, throttling, and caching layers.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a configured endpoint route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    /// Creates a route identifier from its configured name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for RouteId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifier of the internal caller (service or user) issuing a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    /// Creates a caller identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier used when the caller did not present any identity.
    #[must_use]
    pub fn anonymous() -> Self {
        Self("anonymous".to_owned())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Identifier of the organization / tenant a caller belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Unique identifier assigned to every proxied transaction.
///
/// Generated at ingress when the caller did not supply one, echoed back in
/// the `X-Proxy-Request-ID` response header, and attached to every log line
/// and usage sample produced while handling the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh random request identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an identifier supplied by the caller.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_id_round_trips_through_display() {
        let id = RouteId::new("llm-chat");
        assert_eq!(id.to_string(), "llm-chat");
        assert_eq!(id.as_str(), "llm-chat");
    }

    #[test]
    fn generated_request_ids_are_unique() {
        let a = RequestId::generate();
        let b = RequestId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn caller_id_serializes_transparently() {
        let caller = CallerId::new("svc-billing");
        let json = serde_json::to_string(&caller).unwrap();
        assert_eq!(json, "\"svc-billing\"");
    }

    #[test]
    fn anonymous_caller_is_stable() {
        assert_eq!(CallerId::anonymous().as_str(), "anonymous");
    }
}
