//! Connection pool for backend HTTP connections
//!
//! Every backend shares one pooled hyper client for proxied traffic and a
//! second one for health probes, so keep-alive connections are reused across
//! requests instead of dialing the upstream each time.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Body type flowing through the load balancer in both directions
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe a single connection and are not forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// Error from the HTTP client (connect refused, reset, protocol error)
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building the upstream request
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Traffic counters shared by every backend
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Requests sent upstream
    pub total_requests: AtomicU64,
    /// Upstream sends that failed at the transport level
    pub upstream_failures: AtomicU64,
    /// Health probes sent
    pub health_checks: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_health_check(&self) {
        self.health_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_upstream_failures(&self) -> u64 {
        self.upstream_failures.load(Ordering::Relaxed)
    }

    pub fn get_health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    health_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let health_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            health_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to the backend at `base`, keeping method, path, query,
    /// end-to-end headers and the streamed body.
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        base: &Uri,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let uri = upstream_uri(base, path)?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = hyper::Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        let backend_req = Request::from_parts(parts, body);

        self.stats.record_request();

        let response = self.client.request(backend_req).await.map_err(|e| {
            self.stats.record_upstream_failure();
            ForwardError::from(e)
        })?;
        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `base` + `path` on the dedicated health client
    pub async fn probe(&self, base: &Uri, path: &str) -> Result<Response<Incoming>, ForwardError> {
        let uri = upstream_uri(base, path)?;
        let req = Request::builder()
            .method("GET")
            .uri(uri)
            .header("Accept", "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

        self.stats.record_health_check();

        Ok(self.health_client.request(req).await?)
    }
}

/// Join a backend base URI with a request path and query
fn upstream_uri(base: &Uri, path_and_query: &str) -> Result<Uri, ForwardError> {
    let scheme = base.scheme_str().unwrap_or("http");
    let authority = base
        .authority()
        .ok_or_else(|| ForwardError::RequestBuild(format!("backend address {} has no authority", base)))?;

    format!("{}://{}{}", scheme, authority, path_and_query)
        .parse::<Uri>()
        .map_err(|e| ForwardError::RequestBuild(e.to_string()))
}

/// A header is hop-by-hop if it is a fixed connection header or is named in
/// the message's own `Connection` header.
fn is_hop_by_hop(name: &HeaderName, headers: &HeaderMap) -> bool {
    if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
        return true;
    }

    headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case(name.as_str()))
}

/// Remove hop-by-hop headers in place
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let doomed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name, headers))
        .cloned()
        .collect();
    for name in doomed {
        headers.remove(&name);
    }
}
