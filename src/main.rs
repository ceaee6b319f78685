//! CorsProxy - Main entry point
//!
//! A CORS reverse proxy server

use anyhow::Result;
use clap::Parser;
use corsproxy::{ProxyConfig, ProxyServer, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::FmtSubscriber;

/// CorsProxy - fetch any origin with permissive CORS headers
#[derive(Parser, Debug)]
#[command(name = "corsproxy")]
#[command(author = "CorsProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A CORS reverse proxy server")]
struct Args {
    /// Local port to listen on
    #[arg(long, env = "PORT", default_value = "8080")]
    port: u16,

    /// Require an Origin header on proxied requests
    #[arg(
        long,
        env = "REQUIRE_ORIGIN",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    require_origin: bool,

    /// Follow 307/308 redirects instead of returning them
    #[arg(
        long,
        env = "ENABLE_REDIRECT",
        default_value_t = false,
        num_args = 0..=1,
        default_missing_value = "true",
        action = clap::ArgAction::Set
    )]
    enable_redirect: bool,

    /// Maximum number of redirects to follow
    #[arg(long, env = "MAX_REDIRECTS", default_value = "3")]
    max_redirects: usize,

    /// Timeout in seconds for dial, TLS handshake, keep-alive and redirect hops
    #[arg(long, env = "TIMEOUT", default_value = "30")]
    timeout: u64,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            port: self.port,
            proxy: ProxyConfig {
                require_origin: self.require_origin,
                enable_redirect_follow: self.enable_redirect,
                max_redirects: self.max_redirects,
                timeout: Duration::from_secs(self.timeout),
            },
        }
    }

    fn log_level(&self) -> Level {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(args.log_level()).into())
    });

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting CorsProxy v1.0.0");
    info!("CORS proxy started at http://localhost:{}", args.port);

    let server = Arc::new(ProxyServer::new(args.server_config()));

    tokio::select! {
        result = server.run() => {
            if let Err(e) = &result {
                error!("Server error: {:#}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}
