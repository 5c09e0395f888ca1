//! Virtual-hosting reverse proxy server
//!
//! One process, two listeners. The plaintext listener answers ACME
//! challenges and upgrades TLS-enabled hosts to HTTPS; the encrypted
//! listener selects certificates per handshake through the SNI resolver.
//! Both feed the same dispatcher, which authenticates, resolves the
//! backend by host and path prefix, and forwards the request.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri},
    response::IntoResponse,
    Router,
};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::acme;
use crate::config::{AuthConfig, HostingConfig, UpstreamTrust};
use crate::error::Result;
use crate::registry::{AppOptions, AppRegistry, RegistrySettings};
use crate::tls::build_server_config;

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

/// Which listener accepted the connection; stored as a request extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerScheme {
    Http,
    Https,
}

impl ListenerScheme {
    fn as_str(self) -> &'static str {
        match self {
            ListenerScheme::Http => "http",
            ListenerScheme::Https => "https",
        }
    }
}

/// Marker that makes the connection-level service abort the connection
/// instead of writing a response
///
/// Unknown hosts, failed auth and failed challenge lookups all terminate
/// this way so a probing client cannot tell them apart.
#[derive(Debug, Clone, Copy)]
struct DropConnection;

impl fmt::Display for DropConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection dropped")
    }
}

impl std::error::Error for DropConnection {}

fn drop_connection() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    response.extensions_mut().insert(DropConnection);
    response
}

/// Shared proxy state
pub(crate) struct ProxyState {
    registry: Arc<AppRegistry>,
    client: HttpClient,
    auth: Option<AuthConfig>,
    trust: UpstreamTrust,
    challenge_root: Option<PathBuf>,
    timeout: Duration,
}

/// Proxy server and embedding API
pub struct HostingServer {
    config: HostingConfig,
    registry: Arc<AppRegistry>,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    listener_tasks: Mutex<Vec<JoinHandle<()>>>,
    http_addr: Mutex<Option<SocketAddr>>,
    https_addr: Mutex<Option<SocketAddr>>,
}

impl HostingServer {
    /// Create a new server; apps are registered separately via [`add`](Self::add)
    pub fn new(config: HostingConfig) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(AppRegistry::new(RegistrySettings::from_tls_config(
            config.tls.as_ref(),
        )));

        let timeout = Duration::from_secs(config.server.timeout_seconds);
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        let state = Arc::new(ProxyState {
            registry: registry.clone(),
            client,
            auth: config.auth.clone(),
            trust: config.server.trust_upstream,
            challenge_root: config.tls.as_ref().map(|t| t.challenge_root.clone()),
            timeout,
        });

        Ok(Self {
            config,
            registry,
            state,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            listener_tasks: Mutex::new(Vec::new()),
            http_addr: Mutex::new(None),
            https_addr: Mutex::new(None),
        })
    }

    /// Register a hostname
    pub fn add(&self, hostname: &str, opts: AppOptions) -> Result<()> {
        self.registry.add(hostname, opts)
    }

    /// Edit a registered hostname
    pub fn edit(&self, hostname: &str, opts: AppOptions) -> Result<()> {
        self.registry.edit(hostname, opts)
    }

    /// Remove a registered hostname, revoking its certificate watchers
    pub fn remove(&self, hostname: &str) -> Result<()> {
        self.registry.remove(hostname)
    }

    /// Address the plaintext listener is bound to (after [`listen`](Self::listen))
    pub fn http_addr(&self) -> Option<SocketAddr> {
        *self.http_addr.lock().unwrap()
    }

    /// Address the encrypted listener is bound to, if TLS is enabled
    pub fn https_addr(&self) -> Option<SocketAddr> {
        *self.https_addr.lock().unwrap()
    }

    /// Build the Axum router
    fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind both listeners and start accepting connections
    pub async fn listen(&self) -> Result<()> {
        let router = self.router();
        let bind_addr = &self.config.server.bind_addr;

        let http_listener =
            TcpListener::bind(format!("{}:{}", bind_addr, self.config.server.http_port)).await?;
        let http_addr = http_listener.local_addr()?;
        *self.http_addr.lock().unwrap() = Some(http_addr);
        info!("Plaintext listener on {}", http_addr);

        let mut tasks = Vec::with_capacity(2);

        if let Some(ref tls) = self.config.tls {
            let tls_config = Arc::new(build_server_config(self.registry.clone()));
            let acceptor = TlsAcceptor::from(tls_config);

            let https_listener =
                TcpListener::bind(format!("{}:{}", bind_addr, tls.https_port)).await?;
            let https_addr = https_listener.local_addr()?;
            *self.https_addr.lock().unwrap() = Some(https_addr);
            info!("Encrypted listener on {}", https_addr);

            tasks.push(tokio::spawn(accept_loop(
                https_listener,
                router.clone(),
                ListenerScheme::Https,
                Some(acceptor),
                self.shutdown.clone(),
                self.connections.clone(),
            )));
        } else {
            info!("TLS disabled, encrypted listener not started");
        }

        tasks.push(tokio::spawn(accept_loop(
            http_listener,
            router,
            ListenerScheme::Http,
            None,
            self.shutdown.clone(),
            self.connections.clone(),
        )));

        self.listener_tasks.lock().unwrap().extend(tasks);
        Ok(())
    }

    /// Stop accepting connections, drain in-flight requests, then release
    /// certificate watchers
    pub async fn close(&self) {
        // Both listeners observe the same token and stop concurrently
        self.shutdown.cancel();

        let tasks: Vec<_> = self.listener_tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.connections.close();
        let drain = Duration::from_secs(self.config.server.drain_timeout_seconds);
        if tokio::time::timeout(drain, self.connections.wait())
            .await
            .is_err()
        {
            warn!("Drain timeout reached with connections still in flight");
        }

        self.registry.close();
        info!("Shutdown complete");
    }
}

/// Accept connections until shutdown; each connection is tracked so
/// `close` can wait for in-flight requests
async fn accept_loop(
    listener: TcpListener,
    router: Router,
    scheme: ListenerScheme,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let router = router.clone();
        let tls = tls.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        serve_stream(TokioIo::new(tls_stream), peer, router, scheme, shutdown).await
                    }
                    Err(e) => debug!("TLS handshake failed from {}: {}", peer, e),
                },
                None => serve_stream(TokioIo::new(stream), peer, router, scheme, shutdown).await,
            }
        });
    }
}

/// Serve one connection through the router, aborting it without a
/// response when the dispatcher asks for a drop
async fn serve_stream<I>(
    io: TokioIo<I>,
    peer: SocketAddr,
    router: Router,
    scheme: ListenerScheme,
    shutdown: CancellationToken,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: Request<Incoming>| {
        let router = router.clone();
        async move {
            req.extensions_mut().insert(ConnectInfo(peer));
            req.extensions_mut().insert(scheme);

            match router.oneshot(req).await {
                Ok(response) => {
                    if response.extensions().get::<DropConnection>().is_some() {
                        Err(DropConnection)
                    } else {
                        Ok(response)
                    }
                }
                Err(infallible) => match infallible {},
            }
        }
    });

    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                log_connection_error(peer, e);
            }
        }
        _ = shutdown.cancelled() => {
            // Let the in-flight request finish, then close the connection
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                log_connection_error(peer, e);
            }
        }
    }
}

fn log_connection_error(peer: SocketAddr, err: Box<dyn std::error::Error + Send + Sync>) {
    if error_chain_contains::<DropConnection>(&*err) {
        debug!("Dropped connection from {}", peer);
    } else {
        debug!("Error serving connection from {}: {}", peer, err);
    }
}

fn error_chain_contains<T: std::error::Error + 'static>(
    err: &(dyn std::error::Error + 'static),
) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if e.is::<T>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Per-request decision engine
async fn dispatch(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    let scheme = req
        .extensions()
        .get::<ListenerScheme>()
        .copied()
        .unwrap_or(ListenerScheme::Http);
    let path = req.uri().path().to_string();

    // Challenges bypass auth and the registry so that certificate
    // issuance works for hosts that are not registered yet
    if scheme == ListenerScheme::Http {
        if let (Some(root), Some(token)) =
            (state.challenge_root.as_ref(), acme::challenge_token(&path))
        {
            return match acme::read_challenge(root, &token).await {
                Ok(contents) => Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(Body::from(contents))
                    .unwrap(),
                Err(_) => drop_connection(),
            };
        }
    }

    let host = request_host(&req);
    let authenticated = is_authenticated(state.auth.as_ref(), req.headers());
    let app = host.as_deref().and_then(|h| state.registry.lookup(h));

    log_request(&req, peer, host.as_deref(), authenticated, app.is_some(), state.trust);

    let Some(app) = app else {
        return drop_connection();
    };
    if !authenticated {
        return drop_connection();
    }

    // Upgrade plaintext requests for TLS-enabled hosts
    if scheme == ListenerScheme::Http && app.tls.is_some() {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let location = format!("https://{}{}", app.hostname, path_and_query);
        return Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(header::LOCATION, location)
            .body(Body::empty())
            .unwrap();
    }

    let destination = app.route(&path).to_string();
    forward(&state, req, &destination, scheme, peer).await
}

/// Relay the request to the backend and the response back
async fn forward(
    state: &ProxyState,
    req: Request<Body>,
    destination: &str,
    scheme: ListenerScheme,
    peer: SocketAddr,
) -> Response<Body> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let forward_uri = format!("{}{}", destination.trim_end_matches('/'), path_and_query);
    let uri: Uri = match forward_uri.parse() {
        Ok(u) => u,
        Err(e) => {
            error!("Invalid forward URI '{}': {}", forward_uri, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal error.").into_response();
        }
    };
    parts.uri = uri;

    strip_hop_headers(&mut parts.headers);
    if let Some(auth) = &state.auth {
        parts.headers.remove(auth.header.as_str());
    }
    apply_forwarding_policy(&mut parts.headers, state.trust, peer, scheme);

    let forward_req = Request::from_parts(parts, body);

    match tokio::time::timeout(state.timeout, state.client.request(forward_req)).await {
        Ok(Ok(response)) => response.map(Body::new).into_response(),
        Ok(Err(e)) => {
            let (status, message) = classify_upstream_error(&e);
            if status == StatusCode::INTERNAL_SERVER_ERROR {
                error!("Unclassified backend error: {:?}", e);
            } else {
                warn!("Backend error ({}): {}", status, e);
            }
            (status, message).into_response()
        }
        Err(_) => {
            warn!("Backend request timed out after {:?}", state.timeout);
            (StatusCode::GATEWAY_TIMEOUT, "Web server timed out.").into_response()
        }
    }
}

/// Routing key: the declared host, without port, lowercased
fn request_host(req: &Request<Body>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .and_then(|h| h.split(':').next())
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
}

fn is_authenticated(auth: Option<&AuthConfig>, headers: &HeaderMap) -> bool {
    match auth {
        None => true,
        Some(auth) => headers
            .get(auth.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v == auth.secret)
            .unwrap_or(false),
    }
}

/// Remove headers that must not cross the proxy hop
fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove("host");
    headers.remove("connection");
    headers.remove("keep-alive");
    headers.remove("proxy-authenticate");
    headers.remove("proxy-authorization");
    headers.remove("te");
    headers.remove("trailers");
    headers.remove("transfer-encoding");
    headers.remove("upgrade");
}

/// Rewrite origin metadata unless an upstream proxy is trusted
///
/// Without trust, clients must not be able to spoof `X-Forwarded-*`: the
/// inbound values are discarded and replaced with what this proxy
/// observed. With trust, the chain set by the upstream passes through.
fn apply_forwarding_policy(
    headers: &mut HeaderMap,
    trust: UpstreamTrust,
    peer: SocketAddr,
    scheme: ListenerScheme,
) {
    if trust != UpstreamTrust::None {
        return;
    }

    headers.remove("forwarded");
    headers.remove("x-forwarded-host");
    if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
        headers.insert("x-forwarded-for", value);
    }
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(scheme.as_str()),
    );
}

/// Map backend reachability failures to client-visible responses
///
/// These responses are terminal; the request is never replayed against
/// the backend.
fn classify_upstream_error(
    err: &(dyn std::error::Error + 'static),
) -> (StatusCode, &'static str) {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    (StatusCode::SERVICE_UNAVAILABLE, "Web server is down.")
                }
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => (
                    StatusCode::BAD_GATEWAY,
                    "Web server closed the connection unexpectedly.",
                ),
                std::io::ErrorKind::TimedOut => {
                    (StatusCode::GATEWAY_TIMEOUT, "Web server timed out.")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error."),
            };
        }
        if let Some(h) = e.downcast_ref::<hyper::Error>() {
            if h.is_incomplete_message() {
                return (
                    StatusCode::BAD_GATEWAY,
                    "Web server closed the connection unexpectedly.",
                );
            }
        }
        source = e.source();
    }
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error.")
}

/// Remote address for logging: the socket peer, or the trusted chain
fn remote_address(headers: &HeaderMap, peer: SocketAddr, trust: UpstreamTrust) -> String {
    match trust {
        UpstreamTrust::Cloudflare => headers
            .get("cf-connecting-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| peer.ip().to_string()),
        UpstreamTrust::Standard => headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|| peer.ip().to_string()),
        UpstreamTrust::None => peer.ip().to_string(),
    }
}

fn request_country(headers: &HeaderMap, trust: UpstreamTrust) -> Option<String> {
    if trust != UpstreamTrust::Cloudflare {
        return None;
    }
    headers
        .get("cf-ipcountry")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Compress a User-Agent string down to its most telling product token
fn reduce_user_agent(agent: &str) -> String {
    // Drop parenthesized platform segments, then pick the product token
    let mut depth = 0usize;
    let mut cleaned = String::with_capacity(agent.len());
    for c in agent.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => cleaned.push(c),
            _ => {}
        }
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    // Later entrants ship the earlier ones' tokens too, so check most
    // specific first: Edg before Chrome, Chrome before Safari
    for prefix in ["Edg/", "OPR/", "Firefox/", "Chrome/", "Safari/"] {
        if let Some(token) = tokens.iter().find(|t| t.starts_with(prefix)) {
            return token.to_string();
        }
    }
    tokens.first().map(|t| t.to_string()).unwrap_or_default()
}

fn log_request(
    req: &Request<Body>,
    peer: SocketAddr,
    host: Option<&str>,
    authenticated: bool,
    matched: bool,
    trust: UpstreamTrust,
) {
    let remote = remote_address(req.headers(), peer, trust);
    let country = request_country(req.headers(), trust);
    let agent = req
        .headers()
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    info!(
        authorized = authenticated,
        matched,
        remote = %remote,
        country = country.as_deref().unwrap_or("-"),
        host = host.unwrap_or("-"),
        method = %req.method(),
        path = %req.uri().path(),
        agent = %reduce_user_agent(agent),
        "request"
    );
}
