//! Upstream transport
//! Pooled HTTP/HTTPS client shared by the initial forward and every redirect hop
//!
//! Requests are routed through the proxies named by `HTTP_PROXY`, `HTTPS_PROXY`
//! and `ALL_PROXY` unless the host matches `NO_PROXY`. Plain `http` targets are
//! sent to the proxy in absolute form; `https` targets are tunneled with
//! `CONNECT` and TLS runs end to end through the tunnel.

use crate::body::{OutboundBody, ProxyBody};
use crate::error::{BoxError, ProxyError};
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::PROXY_AUTHORIZATION;
use hyper::http::uri::Scheme;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Request, Response, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::client::proxy::matcher::Matcher;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tower_service::Service;
use tracing::debug;

/// One request/response exchange with an upstream
///
/// Implementations never follow redirects on their own. The response is
/// returned as soon as its head arrives; the body streams from the upstream.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(
        &self,
        req: Request<OutboundBody>,
    ) -> Result<Response<ProxyBody>, ProxyError>;
}

type HttpsClient = Client<TimeoutConnector<HttpsConnector<RouteConnector>>, OutboundBody>;

/// Keep-alive connection pool keyed by destination
#[derive(Clone)]
pub struct HttpTransport {
    client: HttpsClient,
    proxies: Arc<Matcher>,
}

impl HttpTransport {
    /// Build the pool with proxies taken from the environment
    ///
    /// `timeout` bounds dial plus TLS handshake and sets TCP keep-alive.
    pub fn new(timeout: Duration) -> Self {
        Self::with_proxies(timeout, Matcher::from_env())
    }

    /// Build the pool with an explicit proxy matcher
    pub fn with_proxies(timeout: Duration, proxies: Matcher) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(timeout));
        http.set_keepalive(Some(timeout));

        let proxies = Arc::new(proxies);
        let route = RouteConnector::new(http, proxies.clone());
        let connector = TimeoutConnector::new(HttpsConnector::new_with_connector(route), timeout);
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self { client, proxies }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(
        &self,
        mut req: Request<OutboundBody>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        debug!("{} {}", req.method(), req.uri());

        // Forwarded requests carry the proxy credentials themselves; tunnels
        // send them on CONNECT instead.
        if req.uri().scheme() == Some(&Scheme::HTTP) {
            if let Some(auth) = self
                .proxies
                .intercept(req.uri())
                .and_then(|proxy| proxy.basic_auth().cloned())
            {
                req.headers_mut().insert(PROXY_AUTHORIZATION, auth);
            }
        }

        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| ProxyError::Upstream(Box::new(e)))?;

        Ok(response.map(|body| body.boxed()))
    }
}

/// Connector that dials the upstream directly or through the matching proxy
#[derive(Clone)]
pub struct RouteConnector {
    http: HttpConnector,
    proxies: Arc<Matcher>,
}

impl RouteConnector {
    pub fn new(http: HttpConnector, proxies: Arc<Matcher>) -> Self {
        Self { http, proxies }
    }
}

type Connecting<T> = Pin<Box<dyn Future<Output = Result<T, BoxError>> + Send>>;

impl Service<Uri> for RouteConnector {
    type Response = RoutedStream;
    type Error = BoxError;
    type Future = Connecting<RoutedStream>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let proxy = match self.proxies.intercept(&dst) {
            Some(proxy) => proxy,
            None => {
                let connecting = self.http.call(dst);
                return Box::pin(async move {
                    Ok::<_, BoxError>(RoutedStream::direct(connecting.await?))
                });
            }
        };

        if proxy.uri().scheme() != Some(&Scheme::HTTP) {
            let uri = proxy.uri().to_string();
            let err: BoxError = format!("unsupported proxy {}", uri).into();
            return Box::pin(async move { Err::<RoutedStream, _>(err) });
        }

        debug!(proxy = %proxy.uri(), dst = %dst, "Connecting through proxy");

        if dst.scheme() == Some(&Scheme::HTTPS) {
            let mut tunnel = Tunnel::new(proxy.uri().clone(), self.http.clone());
            if let Some(auth) = proxy.basic_auth() {
                tunnel = tunnel.with_auth(auth.clone());
            }
            let connecting = tunnel.call(dst);
            Box::pin(async move { Ok::<_, BoxError>(RoutedStream::direct(connecting.await?)) })
        } else {
            let connecting = self.http.call(proxy.uri().clone());
            Box::pin(async move { Ok::<_, BoxError>(RoutedStream::forwarding(connecting.await?)) })
        }
    }
}

/// TCP stream that remembers whether it leads to a forwarding proxy
///
/// The pooled client writes absolute-form request targets on forwarding
/// connections.
pub struct RoutedStream {
    io: TokioIo<TcpStream>,
    forwarding: bool,
}

impl RoutedStream {
    fn direct(io: TokioIo<TcpStream>) -> Self {
        Self {
            io,
            forwarding: false,
        }
    }

    fn forwarding(io: TokioIo<TcpStream>) -> Self {
        Self {
            io,
            forwarding: true,
        }
    }
}

impl Connection for RoutedStream {
    fn connected(&self) -> Connected {
        self.io.connected().proxy(self.forwarding)
    }
}

impl Read for RoutedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for RoutedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }
}

/// Connector wrapper that fails the whole connect step after `timeout`
#[derive(Clone)]
pub struct TimeoutConnector<C> {
    inner: C,
    timeout: Duration,
}

impl<C> TimeoutConnector<C> {
    pub fn new(inner: C, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl<C> Service<Uri> for TimeoutConnector<C>
where
    C: Service<Uri>,
    C::Response: Send + 'static,
    C::Error: Into<BoxError>,
    C::Future: Send + 'static,
{
    type Response = C::Response;
    type Error = BoxError;
    type Future = Connecting<C::Response>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let timeout = self.timeout;
        let connecting = self.inner.call(dst);

        Box::pin(async move {
            match tokio::time::timeout(timeout, connecting).await {
                Ok(result) => result.map_err(Into::into),
                Err(_) => Err(Box::new(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", timeout),
                )) as BoxError),
            }
        })
    }
}
