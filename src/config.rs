//! Proxy configuration
//! Built once at startup and shared read-only by every request

use std::time::Duration;

/// Default local port
pub const DEFAULT_PORT: u16 = 8080;

/// Default number of 307/308 hops followed before giving up
pub const DEFAULT_MAX_REDIRECTS: usize = 3;

/// Default timeout for dial, TLS handshake, keep-alive and redirect hops
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings consulted by the request pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Reject non-preflight requests without an `Origin` header
    pub require_origin: bool,
    /// Follow 307/308 responses instead of handing them to the caller
    pub enable_redirect_follow: bool,
    pub max_redirects: usize,
    pub timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            require_origin: true,
            enable_redirect_follow: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Listener settings plus the pipeline configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub proxy: ProxyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            proxy: ProxyConfig::default(),
        }
    }
}
