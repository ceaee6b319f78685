//! Proxy server implementation
//! Validates the embedded target, forwards the request and returns the
//! upstream response with CORS headers stamped on

use crate::body::{self, ProxyBody};
use crate::config::{ProxyConfig, ServerConfig};
use crate::cors;
use crate::director;
use crate::error::{BoxError, ProxyError};
use crate::redirect::{self, OriginRequest};
use crate::target::TargetUrl;
use crate::transport::{HttpTransport, Transport};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, ORIGIN};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

pub const USAGE: &str = "corsproxy usage:

http://localhost:<port>/http(s)://your-domain.com/endpoint

The scheme may be omitted, in which case http is assumed.
";

/// Outcome of the checks run before any upstream contact
#[derive(Debug)]
pub enum Admission {
    /// Answer locally with the preflight grant
    Preflight,
    /// Forward to this target
    Forward(TargetUrl),
}

/// Request pipeline shared by every connection
pub struct ProxyService {
    config: ProxyConfig,
    transport: Arc<dyn Transport>,
}

impl ProxyService {
    /// Create a pipeline backed by a pooled HTTP/HTTPS client
    pub fn new(config: ProxyConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(config.timeout));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: ProxyConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Produce the response for one inbound request
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        remote_addr: Option<SocketAddr>,
    ) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();

        if req.uri().path() == "/" && (method == Method::GET || method == Method::HEAD) {
            return Self::text_response(StatusCode::OK, USAGE);
        }

        let target = match self.admit(&req) {
            Ok(Admission::Forward(target)) => target,
            Ok(Admission::Preflight) => {
                debug!("Answering preflight for {}", req.uri().path());
                return Self::preflight_response(req.headers());
            }
            Err(e) => {
                warn!(method = %method, path = %req.uri().path(), "Rejected request: {}", e);
                return Self::local_error_response(&e, req.headers());
            }
        };

        debug!(method = %method, target = %target.uri(), "Proxying request");

        match self.forward(req, &target, remote_addr).await {
            Ok(response) => {
                debug!(
                    method = %method,
                    target = %target.uri(),
                    status = response.status().as_u16(),
                    "Proxied request"
                );
                response
            }
            Err(e) => {
                error!(method = %method, target = %target.uri(), "Request error: {}", e);
                Self::gateway_error_response(&e)
            }
        }
    }

    /// Validate a request before contacting anything upstream
    ///
    /// The target is checked first, then preflights are admitted regardless
    /// of the Origin requirement, then the Origin requirement applies.
    pub fn admit<B>(&self, req: &Request<B>) -> Result<Admission, ProxyError> {
        let path = req.uri().path();
        let raw = path.strip_prefix('/').unwrap_or(path);
        let target = TargetUrl::resolve(raw, req.uri().query())?;

        if req.method() == Method::OPTIONS {
            return Ok(Admission::Preflight);
        }

        if self.config.require_origin && !has_origin(req.headers()) {
            return Err(ProxyError::MissingOrigin);
        }

        Ok(Admission::Forward(target))
    }

    /// Send the request upstream and post-process the response
    ///
    /// Bodies stream in both directions; the response is returned once its
    /// head is final.
    async fn forward<B>(
        &self,
        req: Request<B>,
        target: &TargetUrl,
        remote_addr: Option<SocketAddr>,
    ) -> Result<Response<ProxyBody>, ProxyError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let mut outbound = req.map(body::outbound);
        director::direct(&mut outbound, target, remote_addr.map(|addr| addr.ip()));
        let origin = OriginRequest::of(&outbound);

        let response = self.transport.round_trip(outbound).await?;
        let mut response =
            redirect::follow(self.transport.as_ref(), &self.config, &origin, response).await?;

        director::remove_hop_by_hop(response.headers_mut());
        cors::stamp(response.headers_mut());

        let target = target.uri().clone();
        Ok(response.map(move |upstream| {
            upstream.map_err(move |e| {
                warn!(target = %target, "Upstream body error: {}", e);
                e
            })
            .boxed()
        }))
    }

    /// 200 with an empty body granting whatever the preflight asked for
    fn preflight_response(request_headers: &HeaderMap) -> Response<ProxyBody> {
        let mut response = Response::new(body::empty());
        cors::stamp_local(response.headers_mut(), request_headers);
        response
    }

    /// Validation failure, answered before any upstream contact
    fn local_error_response(
        err: &ProxyError,
        request_headers: &HeaderMap,
    ) -> Response<ProxyBody> {
        let mut response = Self::text_response(err.status(), &err.public_message());
        cors::stamp_local(response.headers_mut(), request_headers);
        response
    }

    /// Failure after the upstream was contacted; nothing partial is forwarded
    fn gateway_error_response(err: &ProxyError) -> Response<ProxyBody> {
        let mut response = Self::text_response(err.status(), &err.public_message());
        cors::stamp(response.headers_mut());
        response
    }

    /// Create text response
    fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
        let mut response = Response::new(body::full(text.to_string()));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}

fn has_origin(headers: &HeaderMap) -> bool {
    headers.get(ORIGIN).map(|v| !v.is_empty()).unwrap_or(false)
}

/// Proxy server
pub struct ProxyServer {
    config: ServerConfig,
    service: Arc<ProxyService>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ServerConfig) -> Self {
        let service = Arc::new(ProxyService::new(config.proxy.clone()));
        Self { config, service }
    }

    /// Bind the configured port and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port).parse()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("HTTP server listening on {}", addr);
        info!(
            require_origin = self.config.proxy.require_origin,
            enable_redirect = self.config.proxy.enable_redirect_follow,
            max_redirects = self.config.proxy.max_redirects,
            timeout_secs = self.config.proxy.timeout.as_secs(),
            "Proxy configuration"
        );

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let service = self.service.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, remote_addr, service).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    ///
    /// The request future is dropped with the connection, which cancels any
    /// upstream exchange still in flight for it.
    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        service: Arc<ProxyService>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let service = service.clone();
                    async move { Self::handle_request(req, remote_addr, service).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        service: Arc<ProxyService>,
    ) -> Result<Response<ProxyBody>, Infallible> {
        debug!("{} {} from {}", req.method(), req.uri(), remote_addr);
        Ok(service.handle(req, Some(remote_addr)).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::ScriptedTransport;
    use http_body_util::Full;
    use hyper::header::{
        ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
        ACCESS_CONTROL_MAX_AGE, HOST,
    };

    fn service(
        config: ProxyConfig,
        transport: ScriptedTransport,
    ) -> (ProxyService, Arc<ScriptedTransport>) {
        let transport = Arc::new(transport);
        (ProxyService::with_transport(config, transport.clone()), transport)
    }

    fn open_config() -> ProxyConfig {
        ProxyConfig {
            require_origin: false,
            ..ProxyConfig::default()
        }
    }

    fn request(method: Method, uri: &str) -> hyper::http::request::Builder {
        Request::builder().method(method).uri(uri).header(HOST, "localhost:8080")
    }

    fn empty(builder: hyper::http::request::Builder) -> Request<Full<Bytes>> {
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    async fn body_of(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn assert_cors(response: &Response<ProxyBody>) {
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(response.headers()[ACCESS_CONTROL_MAX_AGE], "3000000");
    }

    #[tokio::test]
    async fn test_usage_page() {
        let (svc, transport) = service(ProxyConfig::default(), ScriptedTransport::new());

        let response = svc.handle(empty(request(Method::GET, "/")), None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_of(response).await.contains("corsproxy usage"));
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_preflight_is_answered_locally_without_origin() {
        let (svc, transport) = service(ProxyConfig::default(), ScriptedTransport::new());
        let req = empty(
            request(Method::OPTIONS, "/https://api.example.com/items")
                .header("access-control-request-method", "DELETE")
                .header("access-control-request-headers", "x-token"),
        );

        let response = svc.handle(req, None).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_METHODS], "DELETE");
        assert_eq!(response.headers()[ACCESS_CONTROL_ALLOW_HEADERS], "x-token");
        assert_eq!(body_of(response).await, "");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_preflight_with_invalid_target_is_rejected() {
        let (svc, _) = service(ProxyConfig::default(), ScriptedTransport::new());

        let response = svc.handle(empty(request(Method::OPTIONS, "/http://")), None).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_cors(&response);
    }

    #[tokio::test]
    async fn test_missing_origin_is_rejected() {
        let (svc, transport) = service(ProxyConfig::default(), ScriptedTransport::new());

        let response = svc
            .handle(empty(request(Method::GET, "/example.com/data")), None)
            .await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_cors(&response);
        assert_eq!(body_of(response).await, "origin header is required on the request");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_empty_origin_counts_as_missing() {
        let (svc, _) = service(ProxyConfig::default(), ScriptedTransport::new());
        let req = empty(request(Method::GET, "/example.com/data").header(ORIGIN, ""));

        let response = svc.handle(req, None).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_invalid_target_is_rejected() {
        let (svc, transport) = service(open_config(), ScriptedTransport::new());

        let response = svc
            .handle(empty(request(Method::GET, "/http://example.com:99999/x")), None)
            .await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_cors(&response);
        assert_eq!(body_of(response).await, "invalid cors proxy url");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_get_root_is_an_invalid_target() {
        let (svc, _) = service(open_config(), ScriptedTransport::new());

        let response = svc.handle(empty(request(Method::POST, "/")), None).await;

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_upstream_responses_pass_through_with_cors() {
        for status in [200u16, 404, 500] {
            let transport = ScriptedTransport::new().respond(
                status,
                &[
                    ("x-upstream", "yes"),
                    ("access-control-allow-origin", "https://elsewhere.test"),
                ],
                "upstream body",
            );
            let (svc, _) = service(open_config(), transport);

            let response = svc
                .handle(empty(request(Method::GET, "/example.com/resource")), None)
                .await;

            assert_eq!(response.status().as_u16(), status);
            assert_cors(&response);
            assert_eq!(response.headers()["x-upstream"], "yes");
            assert_eq!(body_of(response).await, "upstream body");
        }
    }

    #[tokio::test]
    async fn test_outbound_request_is_rewritten() {
        let transport = ScriptedTransport::new().respond(200, &[], "ok");
        let (svc, transport) = service(ProxyConfig::default(), transport);
        let req = request(Method::POST, "/https://api.example.com:8443/v1/items?b=2&a=%20x&a=1")
            .header(ORIGIN, "https://app.example.com")
            .header("set-cookie", "session=stolen")
            .header("set-cookie2", "legacy=stolen")
            .body(Full::new(Bytes::from_static(b"{\"name\":\"x\"}")))
            .unwrap();

        let response = svc.handle(req, Some("10.1.2.3:5555".parse().unwrap())).await;
        assert_eq!(response.status(), StatusCode::OK);

        let requests = transport.requests();
        let sent = &requests[0];
        assert_eq!(sent.method, Method::POST);
        assert_eq!(sent.uri, "https://api.example.com:8443/v1/items?b=2&a=%20x&a=1");
        assert_eq!(sent.headers[HOST], "api.example.com:8443");
        assert_eq!(sent.headers[ORIGIN], "https://app.example.com");
        assert_eq!(sent.headers["x-forwarded-for"], "10.1.2.3");
        assert!(sent.headers.get("set-cookie").is_none());
        assert!(sent.headers.get("set-cookie2").is_none());
        assert_eq!(sent.body, "{\"name\":\"x\"}");
    }

    #[tokio::test]
    async fn test_schemeless_target_uses_http() {
        let transport = ScriptedTransport::new().respond(200, &[], "ok");
        let (svc, transport) = service(open_config(), transport);

        svc.handle(empty(request(Method::GET, "/example.com:8080/a")), None)
            .await;

        assert_eq!(transport.requests()[0].uri, "http://example.com:8080/a");
    }

    #[tokio::test]
    async fn test_hop_by_hop_response_headers_are_dropped() {
        let transport = ScriptedTransport::new().respond(
            200,
            &[("connection", "close"), ("keep-alive", "timeout=5"), ("x-kept", "1")],
            "ok",
        );
        let (svc, _) = service(open_config(), transport);

        let response = svc
            .handle(empty(request(Method::GET, "/example.com/")), None)
            .await;

        assert!(response.headers().get("connection").is_none());
        assert!(response.headers().get("keep-alive").is_none());
        assert_eq!(response.headers()["x-kept"], "1");
    }

    #[tokio::test]
    async fn test_websocket_handshake_is_forwarded_without_upgrade() {
        let transport = ScriptedTransport::new().respond(426, &[], "upgrade required");
        let (svc, transport) = service(open_config(), transport);
        let req = empty(
            request(Method::GET, "/example.com/socket")
                .header("connection", "Upgrade")
                .header("upgrade", "websocket")
                .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ=="),
        );

        let response = svc.handle(req, None).await;
        assert_eq!(response.status().as_u16(), 426);

        let requests = transport.requests();
        let sent = &requests[0];
        assert!(sent.headers.get("upgrade").is_none());
        assert!(sent.headers.get("connection").is_none());
    }

    #[tokio::test]
    async fn test_redirects_are_followed_when_enabled() {
        let transport = ScriptedTransport::new()
            .redirect(307, "/moved")
            .respond(200, &[("x-final", "1")], "final");
        let config = ProxyConfig {
            enable_redirect_follow: true,
            ..open_config()
        };
        let (svc, transport) = service(config, transport);

        let response = svc
            .handle(empty(request(Method::GET, "/example.com/a")), None)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert_eq!(body_of(response).await, "final");
        assert_eq!(transport.requests()[1].uri, "http://example.com/moved");
    }

    #[tokio::test]
    async fn test_redirect_is_returned_when_following_disabled() {
        let transport = ScriptedTransport::new().redirect(307, "/moved");
        let (svc, transport) = service(open_config(), transport);

        let response = svc
            .handle(empty(request(Method::GET, "/example.com/a")), None)
            .await;

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()["location"], "/moved");
        assert_cors(&response);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_redirect_limit_is_a_gateway_error() {
        let transport = ScriptedTransport::new()
            .redirect(307, "/2")
            .redirect(307, "/3");
        let config = ProxyConfig {
            enable_redirect_follow: true,
            max_redirects: 1,
            ..open_config()
        };
        let (svc, _) = service(config, transport);

        let response = svc
            .handle(empty(request(Method::GET, "/example.com/1")), None)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_cors(&response);
        assert_eq!(body_of(response).await, "Bad Gateway");
    }

    #[tokio::test]
    async fn test_redirect_loop_is_reported() {
        let transport = ScriptedTransport::new()
            .redirect(308, "/b")
            .redirect(308, "/b");
        let config = ProxyConfig {
            enable_redirect_follow: true,
            ..open_config()
        };
        let (svc, transport) = service(config, transport);

        let response = svc
            .handle(empty(request(Method::GET, "/example.com/a")), None)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_cors(&response);
        assert!(body_of(response).await.contains("http://example.com/b"));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_transport_failure_is_a_gateway_error() {
        let transport =
            ScriptedTransport::new().fail(ProxyError::Upstream("connection refused".into()));
        let (svc, _) = service(open_config(), transport);

        let response = svc
            .handle(empty(request(Method::GET, "/example.com/a")), None)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_cors(&response);
    }
}
