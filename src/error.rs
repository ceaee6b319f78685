//! Error types for the proxy pipeline

use hyper::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by connectors and the pooled client
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Everything that can stop a request from being proxied
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid cors proxy url")]
    InvalidTargetUrl,

    #[error("origin header is required on the request")]
    MissingOrigin,

    #[error("maximum redirect limit ({0}) reached")]
    RedirectLimitExceeded(usize),

    #[error("invalid redirect location {location:?}: {reason}")]
    InvalidRedirect { location: String, reason: String },

    #[error("upstream request failed: {0}")]
    Upstream(#[source] BoxError),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to build request: {0}")]
    Http(#[from] hyper::http::Error),
}

impl ProxyError {
    /// Status code reported to the caller
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::InvalidTargetUrl | ProxyError::MissingOrigin => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ProxyError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::RedirectLimitExceeded(_)
            | ProxyError::InvalidRedirect { .. }
            | ProxyError::Upstream(_)
            | ProxyError::Http(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Body written to the caller
    ///
    /// Validation failures carry their message verbatim; anything that
    /// happened after contacting the upstream gets a generic gateway text.
    pub fn public_message(&self) -> String {
        match self {
            ProxyError::InvalidTargetUrl | ProxyError::MissingOrigin => self.to_string(),
            ProxyError::Timeout(_) => "Gateway Timeout".to_string(),
            _ => "Bad Gateway".to_string(),
        }
    }
}
