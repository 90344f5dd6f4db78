//! Header handling on both legs of a relayed call.
//!
//! Hop-by-hop headers (RFC 9110 section 7.6.1) describe one connection and
//! never cross the relay. On the upstream leg the per-route strip list and
//! injected headers from configuration are applied on top, and the route's
//! credential lands in its configured auth header, marked sensitive so
//! tracing output elides it.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use relay_config::EndpointRoute;
use relay_core::RelayError;

static HOP_BY_HOP: Lazy<[HeaderName; 8]> = Lazy::new(|| {
    [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
});

/// Builds the header map for an upstream attempt from the caller's headers
/// and the route's header policy.
///
/// `Host` and `Content-Length` are recomputed by the HTTP client for the
/// rewritten request; `Accept-Encoding` is dropped so the client negotiates
/// a coding it can decode. Invalid configured header names or values are
/// skipped with a warning rather than failing the request, except the auth
/// header itself, which must be usable when a credential is configured.
pub fn prepare_upstream_headers(
    headers: &HeaderMap,
    route: &EndpointRoute,
    credential: Option<&SecretString>,
) -> Result<HeaderMap, RelayError> {
    let mut out = headers.clone();
    for name in HOP_BY_HOP.iter() {
        out.remove(name);
    }
    out.remove(header::HOST);
    out.remove(header::CONTENT_LENGTH);
    out.remove(header::ACCEPT_ENCODING);

    for name in &route.strip_request_headers {
        out.remove(name.as_str());
    }

    for (raw_name, raw_value) in &route.upstream_headers {
        let Ok(name) = HeaderName::from_bytes(raw_name.as_bytes()) else {
            warn!(route = %route.id, header = %raw_name, "skipping invalid upstream header name");
            continue;
        };
        let Ok(value) = HeaderValue::from_str(raw_value) else {
            warn!(route = %route.id, header = %raw_name, "skipping invalid upstream header value");
            continue;
        };
        out.insert(name, value);
    }

    if let Some(secret) = credential {
        let name = HeaderName::from_bytes(route.auth_header.as_bytes()).map_err(|_| {
            RelayError::internal(format!(
                "route {:?} has invalid auth header name {:?}",
                route.id, route.auth_header
            ))
        })?;
        let mut value = HeaderValue::from_str(secret.expose_secret()).map_err(|_| {
            RelayError::internal(format!(
                "credential for route {:?} is not a valid header value",
                route.id
            ))
        })?;
        value.set_sensitive(true);
        out.insert(name, value);
    }

    Ok(out)
}

/// Strips hop-by-hop headers from an upstream answer before it is relayed
/// or cached. `Content-Length` goes too: the client may have decoded the
/// body, and the server recomputes it for the buffered response.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers.remove(header::CONTENT_LENGTH);
}
