use crate::error::{json_error_response, GatewayError, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::router::{Route, RouteTable};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that apply to a single connection and are never forwarded
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

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Shared, read-only state for every connection
struct ProxyState {
    routes: RouteTable,
    pool: ConnectionPool,
    health_message: Bytes,
}

/// The public reverse proxy listener
pub struct ProxyServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the public listener; nothing is served until [`run`](Self::run)
    pub async fn bind(
        addr: SocketAddr,
        routes: RouteTable,
        pool_config: PoolConfig,
        health_message: impl Into<String>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| GatewayError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let state = Arc::new(ProxyState {
            routes,
            pool: ConnectionPool::new(pool_config),
            health_message: Bytes::from(health_message.into()),
        });

        Ok(Self {
            listener,
            local_addr,
            state,
            shutdown_rx,
        })
    }

    /// Address actually bound (useful when binding port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn routes(&self) -> &RouteTable {
        &self.state.routes
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        info!(addr = %self.local_addr, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.state.pool.stats();
        info!(
            total_requests = stats.get_total_requests(),
            failed_requests = stats.get_failed_requests(),
            "Proxy server stopped"
        );

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ProxyState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path = req.uri().path().to_string();

    let route = match state.routes.match_path(&path) {
        Some(route) => route.clone(),
        None => {
            if is_health_request(&req) {
                return Ok(health_response(state.health_message.clone()));
            }
            debug!(path, method = %req.method(), request_id, "No route for request");
            return Ok(json_error_response(
                ProxyErrorCode::NoRoute,
                format!("No route for path {}", path),
            ));
        }
    };

    debug!(
        route = %route.name,
        port = route.target_port,
        method = %req.method(),
        uri = %req.uri(),
        request_id,
        "Incoming request"
    );

    if is_upgrade_request(&req) && route.allow_websocket {
        return handle_upgrade(req, route, request_id, client_addr).await;
    }

    let forwarded_host = original_host(&req);
    let headers = req.headers_mut();
    strip_hop_by_hop(headers);
    set_forwarding_headers(headers, route.target_port, client_addr, &request_id, forwarded_host);

    let result = tokio::time::timeout(
        route.request_timeout,
        state.pool.send_request(req, route.target_port),
    )
    .await;

    match result {
        Ok(Ok(mut response)) => {
            strip_hop_by_hop(response.headers_mut());
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }
            Ok(response)
        }
        Ok(Err(e)) => {
            warn!(route = %route.name, port = route.target_port, error = %e, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                format!("Backend '{}' is unavailable", route.name),
            ))
        }
        Err(_) => {
            warn!(
                route = %route.name,
                port = route.target_port,
                timeout_secs = route.request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    route.request_timeout.as_secs()
                ),
            ))
        }
    }
}

fn is_health_request<B>(req: &Request<B>) -> bool {
    req.uri().path() == "/" && (req.method() == Method::GET || req.method() == Method::HEAD)
}

fn health_response(body: Bytes) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(body).map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Host the client addressed, from the Host header or the HTTP/2 authority
fn original_host<B>(req: &Request<B>) -> Option<HeaderValue> {
    req.headers().get(hyper::header::HOST).cloned().or_else(|| {
        req.uri()
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok())
    })
}

/// Remove hop-by-hop headers, including any listed in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in &listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Point the request at the backend and record where it came from.
///
/// X-Forwarded-* values are overwritten, never appended: the gateway is the
/// first trusted hop.
fn set_forwarding_headers(
    headers: &mut HeaderMap,
    port: u16,
    client_addr: SocketAddr,
    request_id: &str,
    original_host: Option<HeaderValue>,
) {
    if let Ok(value) = HeaderValue::from_str(&format!("127.0.0.1:{}", port)) {
        headers.insert(hyper::header::HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
}

/// Check if a request asks for a protocol upgrade (WebSocket or other)
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("upgrade"));

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

fn get_upgrade_type<B>(req: &Request<B>) -> String {
    req.headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Copy of the client's upgrade request addressed to the backend.
///
/// `Connection` and `Upgrade` are kept so the backend can accept the upgrade.
fn build_upgrade_request<B>(
    req: &Request<B>,
    port: u16,
    client_addr: SocketAddr,
    request_id: &str,
) -> Request<Empty<Bytes>> {
    let mut backend_req = Request::new(Empty::<Bytes>::new());
    *backend_req.method_mut() = req.method().clone();
    if let Some(path_and_query) = req.uri().path_and_query() {
        *backend_req.uri_mut() = Uri::from(path_and_query.clone());
    }

    let headers = backend_req.headers_mut();
    for (name, value) in req.headers() {
        headers.append(name.clone(), value.clone());
    }
    set_forwarding_headers(headers, port, client_addr, request_id, original_host(req));

    backend_req
}

/// Handle a WebSocket (or other Upgrade) request by tunnelling it to the backend
async fn handle_upgrade(
    mut req: Request<Incoming>,
    route: Route,
    request_id: String,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let upgrade_type = get_upgrade_type(&req);
    let port = route.target_port;
    debug!(route = %route.name, request_id, upgrade_type, "Handling upgrade request");

    let backend_req = build_upgrade_request(&req, port, client_addr, &request_id);

    let stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(route = %route.name, port, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                format!("Backend '{}' is unavailable", route.name),
            ));
        }
    };

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(route = %route.name, port, error = %e, "Backend handshake failed");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Backend handshake failed",
            ));
        }
    };

    let conn_route = route.name.clone();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(route = conn_route, error = %e, "Backend upgrade connection closed with error");
        }
    });

    let send = tokio::time::timeout(route.request_timeout, sender.send_request(backend_req));
    let mut backend_response = match send.await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(route = %route.name, port, error = %e, "Failed to send upgrade request to backend");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Failed to send upgrade request to backend",
            ));
        }
        Err(_) => {
            warn!(
                route = %route.name,
                port,
                timeout_secs = route.request_timeout.as_secs(),
                "Upgrade handshake timed out"
            );
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Upgrade handshake timed out after {} seconds",
                    route.request_timeout.as_secs()
                ),
            ));
        }
    };

    // Backend declined; pass its answer through minus hop-by-hop headers
    if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!(route = %route.name, status = %backend_response.status(), "Backend rejected upgrade request");
        strip_hop_by_hop(backend_response.headers_mut());
        let (parts, body) = backend_response.into_parts();
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    info!(route = %route.name, request_id, upgrade_type, "Upgrade accepted by backend");

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Some(headers) = response.headers_mut() {
        for (name, value) in backend_response.headers() {
            if name == hyper::header::CONTENT_LENGTH || name == hyper::header::TRANSFER_ENCODING {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }
    let response = response
        .body(empty_body())
        .expect("valid response builder");

    let client_upgrade = hyper::upgrade::on(&mut req);
    let backend_upgrade = hyper::upgrade::on(&mut backend_response);
    tokio::spawn(tunnel(client_upgrade, backend_upgrade, route.name, request_id));

    Ok(response)
}

/// Copy bytes both ways until either side closes, then close both
async fn tunnel(client: OnUpgrade, backend: OnUpgrade, route: String, request_id: String) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(route, request_id, error = %e, "Upgrade did not complete");
            return;
        }
    };

    let mut client_io = TokioIo::new(client);
    let mut backend_io = TokioIo::new(backend);

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                route,
                request_id,
                client_to_backend,
                backend_to_client,
                "Tunnel closed normally"
            );
        }
        Err(e) => {
            debug!(route, request_id, error = %e, "Tunnel closed with error");
        }
    }
}
