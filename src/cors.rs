//! CORS header injection
//! Stamps permissive cross-origin headers on everything the proxy returns

use hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
    ACCESS_CONTROL_REQUEST_METHOD,
};

pub const ALLOW_ORIGIN: &str = "*";
pub const MAX_AGE: &str = "3000000";

/// Set the headers every response carries
pub fn stamp(headers: &mut HeaderMap) {
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static(ALLOW_ORIGIN));
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE));
}

/// Stamp a locally generated response, echoing the caller's preflight asks
///
/// The requested method and header list are granted verbatim.
pub fn stamp_local(headers: &mut HeaderMap, request_headers: &HeaderMap) {
    stamp(headers);

    if let Some(method) = non_empty(request_headers, &ACCESS_CONTROL_REQUEST_METHOD) {
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, method.clone());
    }
    if let Some(requested) = non_empty(request_headers, &ACCESS_CONTROL_REQUEST_HEADERS) {
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
    }
}

fn non_empty<'a>(
    headers: &'a HeaderMap,
    name: &hyper::header::HeaderName,
) -> Option<&'a HeaderValue> {
    headers.get(name).filter(|v| !v.is_empty())
}
