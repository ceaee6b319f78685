//! CorsProxy - A CORS reverse proxy server
//!
//! Fetches `http(s)://host/path` given as the request path and returns the
//! upstream response with permissive cross-origin headers:
//! - Target URL resolution with an `http` default scheme
//! - Origin gate and locally answered preflights
//! - Optional, bounded and loop-safe 307/308 redirect following
//! - Pooled HTTP/HTTPS upstream transport honoring proxy environment variables
//! - Streamed request and response bodies

pub mod body;
pub mod config;
pub mod cors;
pub mod director;
pub mod error;
pub mod proxy;
pub mod redirect;
pub mod target;
pub mod transport;

pub use body::ProxyBody;
pub use config::{ProxyConfig, ServerConfig};
pub use error::ProxyError;
pub use proxy::{ProxyServer, ProxyService};
pub use target::TargetUrl;
pub use transport::{HttpTransport, Transport};
