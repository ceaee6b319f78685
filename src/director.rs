//! Forwarding director
//! Points an inbound request at the resolved target and scrubs its headers

use crate::target::TargetUrl;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Version};
use std::net::IpAddr;

/// Cookie-setting headers a caller could smuggle toward the upstream
const STRIPPED_REQUEST_HEADERS: [&str; 2] = ["set-cookie", "set-cookie2"];

/// Headers that only describe the current connection
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Rewrite `req` so it targets `target` instead of the local listener
pub fn direct<B>(req: &mut Request<B>, target: &TargetUrl, client_ip: Option<IpAddr>) {
    *req.uri_mut() = target.uri().clone();
    *req.version_mut() = Version::HTTP_11;

    let headers = req.headers_mut();
    remove_hop_by_hop(headers);
    for name in STRIPPED_REQUEST_HEADERS {
        headers.remove(name);
    }

    if let Ok(host) = HeaderValue::from_str(target.authority()) {
        headers.insert(HOST, host);
    }

    if let Some(ip) = client_ip {
        append_forwarded_for(headers, ip);
    }
}

/// Drop hop-by-hop headers, including any the `Connection` header names
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in named {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
