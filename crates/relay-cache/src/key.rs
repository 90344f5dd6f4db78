//! Deterministic cache keying.
//!
//! A key is the SHA-256 of the request identity: route, method, path,
//! normalized query string, and the values of the route's configured vary
//! headers. Two requests that differ only in query parameter order or in
//! headers outside the vary list map to the same key.

use std::fmt::Write as _;

use sha2::{Digest, Sha256};

use relay_core::{ProxyRequest, RouteId};

/// Computes the cache key for `request` on `route`.
#[must_use]
pub fn cache_key(route: &RouteId, request: &ProxyRequest, vary_headers: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(route.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.path.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized_query(request.query.as_deref()).as_bytes());

    for name in vary_headers {
        hasher.update(b"\n");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        if let Some(value) = request.headers.get(name.as_str()) {
            hasher.update(value.as_bytes());
        }
    }

    let digest = hasher.finalize();
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

/// Query parameters sorted by full `name=value` pair, so parameter order
/// does not fragment the cache.
fn normalized_query(query: Option<&str>) -> String {
    let Some(query) = query else {
        return String::new();
    };
    if query.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
    pairs.sort_unstable();
    pairs.join("&")
}
