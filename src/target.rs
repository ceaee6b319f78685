//! Target resolution
//! Turns the path suffix of an inbound request into the upstream URL

use crate::error::ProxyError;
use hyper::Uri;
use url::{Position, Url};

/// Returns true when the string already names an http(s) scheme
pub fn has_scheme(raw: &str) -> bool {
    raw.starts_with("http://") || raw.starts_with("https://")
}

/// Validated upstream destination for one inbound request
///
/// Always carries a non-empty scheme and host. The query string is the one
/// the caller sent to the proxy, attached without re-encoding.
#[derive(Debug, Clone)]
pub struct TargetUrl {
    url: Url,
    uri: Uri,
}

impl TargetUrl {
    /// Resolve the embedded target
    ///
    /// `raw` is the inbound path with the leading `/` removed, `query` is the
    /// inbound query string. A missing scheme defaults to `http`.
    pub fn resolve(raw: &str, query: Option<&str>) -> Result<Self, ProxyError> {
        let candidate = if has_scheme(raw) {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = Url::parse(&candidate).map_err(|_| ProxyError::InvalidTargetUrl)?;
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(ProxyError::InvalidTargetUrl);
        }

        let mut outbound = format!(
            "{}://{}{}",
            url.scheme(),
            &url[Position::BeforeHost..Position::AfterPort],
            url.path()
        );
        if let Some(q) = query {
            outbound.push('?');
            outbound.push_str(q);
        }

        let uri: Uri = outbound.parse().map_err(|_| ProxyError::InvalidTargetUrl)?;

        Ok(Self { url, uri })
    }

    /// Host with the port when one was given, as sent in the `Host` header
    pub fn authority(&self) -> &str {
        &self.url[Position::BeforeHost..Position::AfterPort]
    }

    /// Absolute outbound request URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }
}
