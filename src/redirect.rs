//! Redirect following
//!
//! After the first upstream exchange the engine inspects each response and,
//! when enabled, chases 307/308 redirects itself:
//!
//! - every hop reuses the method and headers of the originating request and
//!   never carries a body
//! - relative `Location` values are resolved against the scheme and host of
//!   the originating request, not of the latest hop
//! - a `Location` equal to the URL of the hop that produced it ends the chain
//!   with a synthesized 400
//! - reaching `max_redirects` aborts with [`ProxyError::RedirectLimitExceeded`]
//!
//! Hops run one after another inside the caller's future, so dropping that
//! future (client gone, deadline hit) cancels the hop in flight and no
//! further hop is started.

use crate::body::{self, OutboundBody, ProxyBody};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::target::has_scheme;
use crate::transport::Transport;
use hyper::header::{
    HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, TRANSFER_ENCODING,
};
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use tracing::{debug, warn};
use url::Url;

/// The first outbound request of a chain, which every hop is derived from
#[derive(Debug, Clone)]
pub struct OriginRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
}

impl OriginRequest {
    /// Snapshot an already-directed outbound request
    pub fn of<B>(req: &Request<B>) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            headers: req.headers().clone(),
        }
    }

    /// Resolve a `Location` value the way a browser on the origin page would
    pub fn resolve_location(&self, location: &str) -> Result<String, ProxyError> {
        if has_scheme(location) {
            return Ok(location.to_string());
        }

        let invalid = |reason: String| ProxyError::InvalidRedirect {
            location: location.to_string(),
            reason,
        };

        let (scheme, authority) = match (self.uri.scheme_str(), self.uri.authority()) {
            (Some(scheme), Some(authority)) => (scheme, authority.as_str()),
            _ => return Err(invalid("originating request has no absolute URI".to_string())),
        };

        let base = Url::parse(&format!("{}://{}/", scheme, authority))
            .map_err(|e| invalid(e.to_string()))?;
        let resolved = base.join(location).map_err(|e| invalid(e.to_string()))?;

        Ok(resolved.to_string())
    }

    /// Bodiless request for the next hop
    pub fn follow_up(&self, url: &str) -> Result<Request<OutboundBody>, ProxyError> {
        let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| {
            ProxyError::InvalidRedirect {
                location: url.to_string(),
                reason: e.to_string(),
            }
        })?;

        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body::empty_outbound())?;

        let headers = req.headers_mut();
        *headers = self.headers.clone();
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);
        headers.remove(TRANSFER_ENCODING);

        Ok(req)
    }
}

/// Per-request bookkeeping, discarded once the response is final
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectState {
    previous_url: String,
    redirect_count: usize,
}

impl RedirectState {
    pub fn new(origin: &OriginRequest) -> Self {
        Self {
            previous_url: origin.uri.to_string(),
            redirect_count: 0,
        }
    }

    pub fn redirect_count(&self) -> usize {
        self.redirect_count
    }

    fn record_hop(&mut self) {
        self.redirect_count += 1;
    }
}

/// What to do with the current response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Hand the response on unchanged
    Done,
    /// Request this URL next
    Follow(String),
    /// The response redirects back to the URL that produced it
    LoopDetected(String),
}

/// Decide the next step for `response` without touching the network
///
/// Only the status and headers are looked at. On [`Decision::Follow`] the
/// state already points at the returned URL.
pub fn inspect<B>(
    config: &ProxyConfig,
    origin: &OriginRequest,
    response: &Response<B>,
    state: &mut RedirectState,
) -> Result<Decision, ProxyError> {
    if !config.enable_redirect_follow || !is_followed_status(response.status()) {
        return Ok(Decision::Done);
    }

    let location = match response.headers().get(LOCATION) {
        Some(value) if !value.is_empty() => value,
        _ => return Ok(Decision::Done),
    };

    if state.redirect_count >= config.max_redirects {
        return Err(ProxyError::RedirectLimitExceeded(config.max_redirects));
    }

    let location = location.to_str().map_err(|e| ProxyError::InvalidRedirect {
        location: String::from_utf8_lossy(location.as_bytes()).into_owned(),
        reason: e.to_string(),
    })?;
    let next = origin.resolve_location(location)?;

    if next == state.previous_url {
        return Ok(Decision::LoopDetected(next));
    }

    state.previous_url = next.clone();
    Ok(Decision::Follow(next))
}

/// Chase redirects starting from the response to the originating request
///
/// Each hop replaces the working response; only the last one is returned.
/// The unread body of a followed redirect is dropped with it. The per-hop
/// timeout covers the exchange up to the response head; the final body
/// streams without a deadline.
pub async fn follow<T>(
    transport: &T,
    config: &ProxyConfig,
    origin: &OriginRequest,
    response: Response<ProxyBody>,
) -> Result<Response<ProxyBody>, ProxyError>
where
    T: Transport + ?Sized,
{
    let mut state = RedirectState::new(origin);
    let mut response = response;

    loop {
        match inspect(config, origin, &response, &mut state)? {
            Decision::Done => return Ok(response),
            Decision::LoopDetected(url) => {
                warn!(url = %url, hops = state.redirect_count(), "Redirect loop detected");
                return Ok(loop_response(&url));
            }
            Decision::Follow(url) => {
                debug!(
                    status = response.status().as_u16(),
                    hop = state.redirect_count() + 1,
                    url = %url,
                    "Following redirect"
                );

                let req = origin.follow_up(&url)?;
                response = tokio::time::timeout(config.timeout, transport.round_trip(req))
                    .await
                    .map_err(|_| ProxyError::Timeout(config.timeout))??;
                state.record_hop();
            }
        }
    }
}

/// Only redirects that preserve method and body are followed
fn is_followed_status(status: StatusCode) -> bool {
    status == StatusCode::TEMPORARY_REDIRECT || status == StatusCode::PERMANENT_REDIRECT
}

fn loop_response(url: &str) -> Response<ProxyBody> {
    let text = format!(
        "redirect loop detected: redirect URL is the same as previous: {}",
        url
    );

    let mut response = Response::new(body::full(text));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
