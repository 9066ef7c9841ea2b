//! A single upstream server behind the load balancer
//!
//! Liveness sits behind its own lock and the in-flight counter is a lock-free
//! atomic, so health updates never contend with connection accounting.

use crate::pool::{ConnectionPool, ForwardError, ProxyBody};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::{Request, Response, Uri};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::warn;

/// Error for backend addresses that cannot be turned into an upstream URI
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("invalid backend address '{0}': {1}")]
    Invalid(String, String),
    #[error("backend address '{0}' uses unsupported scheme '{1}' (only http is proxied)")]
    UnsupportedScheme(String, String),
    #[error("backend address '{0}' has no host")]
    MissingHost(String),
    #[error("backend address '{0}' must not carry a path")]
    UnexpectedPath(String),
}

/// Parse `host:port` or `http://host:port` into a normalized upstream URI
pub fn parse_address(raw: &str) -> Result<Uri, AddressError> {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let uri = with_scheme
        .parse::<Uri>()
        .map_err(|e| AddressError::Invalid(raw.to_string(), e.to_string()))?;

    let scheme = uri.scheme_str().unwrap_or("http");
    if !scheme.eq_ignore_ascii_case("http") {
        return Err(AddressError::UnsupportedScheme(raw.to_string(), scheme.to_string()));
    }

    let authority = match uri.authority() {
        Some(a) if !a.host().is_empty() => a.clone(),
        _ => return Err(AddressError::MissingHost(raw.to_string())),
    };

    if let Some(pq) = uri.path_and_query() {
        if pq.as_str() != "/" && !pq.as_str().is_empty() {
            return Err(AddressError::UnexpectedPath(raw.to_string()));
        }
    }

    Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query("/")
        .build()
        .map_err(|e| AddressError::Invalid(raw.to_string(), e.to_string()))
}

/// Point-in-time view of a backend, for status reporting
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub address: String,
    pub alive: bool,
    pub active_connections: i64,
}

/// One upstream target
pub struct Backend {
    address: Uri,
    alive: RwLock<bool>,
    active_connections: AtomicI64,
    transport: Arc<ConnectionPool>,
}

impl Backend {
    /// Create a backend, alive and idle
    pub fn new(address: Uri, transport: Arc<ConnectionPool>) -> Self {
        Self {
            address,
            alive: RwLock::new(true),
            active_connections: AtomicI64::new(0),
            transport,
        }
    }

    /// Create a backend from an address string
    pub fn parse(address: &str, transport: Arc<ConnectionPool>) -> Result<Self, AddressError> {
        Ok(Self::new(parse_address(address)?, transport))
    }

    pub fn address(&self) -> &Uri {
        &self.address
    }

    /// `http://host:port` without the trailing slash
    pub fn display_address(&self) -> String {
        self.address.to_string().trim_end_matches('/').to_string()
    }

    pub fn set_alive(&self, alive: bool) {
        *self.alive.write() = alive;
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.read()
    }

    pub fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Count one in-flight request until the returned guard is dropped
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.increment_connections();
        ConnectionGuard {
            backend: Arc::clone(self),
        }
    }

    /// Proxy a request to this backend
    pub async fn forward(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ForwardError> {
        self.transport.send_request(req, &self.address).await
    }

    /// GET `path` on this backend through the health client
    pub async fn probe(&self, path: &str) -> Result<Response<Incoming>, ForwardError> {
        self.transport.probe(&self.address, path).await
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        BackendSnapshot {
            address: self.display_address(),
            alive: self.is_alive(),
            active_connections: self.active_connections(),
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("address", &self.address)
            .field("alive", &self.is_alive())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// Decrements the backend's in-flight counter when dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    backend: Arc<Backend>,
}

impl ConnectionGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.decrement_connections();
    }
}

/// Response body that keeps its backend's request counted until the body is
/// finished or dropped, and marks the backend dead if the upstream stream fails
pub struct TrackedBody {
    inner: ProxyBody,
    guard: ConnectionGuard,
}

impl TrackedBody {
    pub fn new(inner: ProxyBody, guard: ConnectionGuard) -> Self {
        Self { inner, guard }
    }
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);

        if let Poll::Ready(Some(Err(ref e))) = polled {
            let backend = this.guard.backend();
            warn!(backend = %backend.display_address(), error = %e, "Upstream failed while streaming response, marking backend down");
            backend.set_alive(false);
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use http_body_util::{BodyExt, Full};

    fn test_backend(address: &str) -> Arc<Backend> {
        let transport = Arc::new(ConnectionPool::new(PoolConfig::default()));
        Arc::new(Backend::parse(address, transport).unwrap())
    }

    #[test]
    fn test_new_backend_is_alive_and_idle() {
        let backend = test_backend("127.0.0.1:4000");
        assert!(backend.is_alive());
        assert_eq!(backend.active_connections(), 0);
        assert_eq!(backend.display_address(), "http://127.0.0.1:4000");
    }

    #[test]
    fn test_set_alive() {
        let backend = test_backend("127.0.0.1:4000");
        backend.set_alive(false);
        assert!(!backend.is_alive());
        backend.set_alive(false);
        assert!(!backend.is_alive());
        backend.set_alive(true);
        assert!(backend.is_alive());
    }

    #[test]
    fn test_guard_pairs_increment_and_decrement() {
        let backend = test_backend("127.0.0.1:4000");

        let first = backend.track();
        let second = backend.track();
        assert_eq!(backend.active_connections(), 2);

        drop(first);
        assert_eq!(backend.active_connections(), 1);
        drop(second);
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn test_guard_released_on_panic() {
        let backend = test_backend("127.0.0.1:4000");

        let b = Arc::clone(&backend);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = b.track();
            panic!("handler blew up");
        }));

        assert!(result.is_err());
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn test_concurrent_tracking_returns_to_zero() {
        let backend = test_backend("127.0.0.1:4000");

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        let _guard = backend.track();
                        assert!(backend.active_connections() > 0);
                    }
                });
            }
        });

        assert_eq!(backend.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_tracked_body_streams_and_releases_on_drop() {
        let backend = test_backend("127.0.0.1:4000");
        let inner = Full::new(Bytes::from_static(b"hello"))
            .map_err(|never| match never {})
            .boxed();

        let body = TrackedBody::new(inner, backend.track());
        assert_eq!(backend.active_connections(), 1);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
        assert_eq!(backend.active_connections(), 0);
        assert!(backend.is_alive());
    }

    #[test]
    fn test_snapshot() {
        let backend = test_backend("http://10.1.2.3:8080");
        let _guard = backend.track();
        backend.set_alive(false);

        assert_eq!(
            backend.snapshot(),
            BackendSnapshot {
                address: "http://10.1.2.3:8080".to_string(),
                alive: false,
                active_connections: 1,
            }
        );
    }

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(
            parse_address("127.0.0.1:4000").unwrap().to_string(),
            "http://127.0.0.1:4000/"
        );
        assert_eq!(
            parse_address("http://localhost:8080/").unwrap().to_string(),
            "http://localhost:8080/"
        );
        assert_eq!(
            parse_address("  backend.internal  ").unwrap().to_string(),
            "http://backend.internal/"
        );
    }

    #[test]
    fn test_parse_address_rejections() {
        assert!(matches!(
            parse_address("https://127.0.0.1:4000"),
            Err(AddressError::UnsupportedScheme(_, _))
        ));
        assert!(matches!(
            parse_address("http://127.0.0.1:4000/api"),
            Err(AddressError::UnexpectedPath(_))
        ));
        assert!(matches!(
            parse_address("not a host"),
            Err(AddressError::Invalid(_, _))
        ));
    }
}
