//! Reverse proxy server and request router
//!
//! The [`Router`] picks a backend for every inbound request and forwards it;
//! [`ProxyServer`] owns the listener, one task per connection, and the
//! graceful drain on shutdown.

use crate::backend::TrackedBody;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::loadbalancer::BackendPool;
use crate::pool::{ForwardError, ProxyBody};
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Default time in-flight connections get to finish after shutdown
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Routes each request to one backend of the pool
#[derive(Debug, Clone)]
pub struct Router {
    pool: Arc<BackendPool>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(pool: Arc<BackendPool>, request_timeout: Duration) -> Self {
        Self {
            pool,
            request_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Forward `req` to a selected backend.
    ///
    /// Never fails: every load-balancer-side problem becomes a 503 JSON
    /// response. A backend whose forward call fails is marked dead on the spot.
    pub async fn handle(&self, mut req: Request<ProxyBody>, client_addr: Option<SocketAddr>) -> Response<ProxyBody> {
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let headers = req.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(X_REQUEST_ID, value);
        }
        if let Some(addr) = client_addr {
            let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{}, {}", prior, addr.ip()),
                None => addr.ip().to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let Some(backend) = self.pool.next_backend() else {
            warn!(
                request_id,
                method = %req.method(),
                uri = %req.uri(),
                total_backends = self.pool.total_count(),
                "No backend available"
            );
            let response = json_error_response(ProxyErrorCode::NoBackendAvailable, "Service Unavailable");
            return with_request_id(response, &request_id);
        };

        debug!(
            request_id,
            method = %req.method(),
            uri = %req.uri(),
            backend = %backend.display_address(),
            "Forwarding request"
        );

        let client_failed = Arc::new(AtomicBool::new(false));
        let req = req.map(|body| ClientBody::new(body, Arc::clone(&client_failed)).boxed());

        let guard = backend.track();
        let result = tokio::time::timeout(self.request_timeout, backend.forward(req)).await;

        let response = match result {
            Ok(Ok(response)) => response.map(|body| TrackedBody::new(body, guard).boxed()),
            Ok(Err(ForwardError::RequestBuild(reason))) => {
                error!(request_id, backend = %backend.display_address(), reason, "Failed to build upstream request");
                json_error_response(ProxyErrorCode::InternalError, "Failed to build upstream request")
            }
            // The client broke its own request; the backend did nothing wrong
            Ok(Err(e)) if client_failed.load(Ordering::Acquire) => {
                warn!(
                    request_id,
                    backend = %backend.display_address(),
                    error = %e,
                    "Client request body failed, backend left up"
                );
                json_error_response(ProxyErrorCode::ClientBodyError, "Request body could not be read")
            }
            Ok(Err(e)) => {
                backend.set_alive(false);
                warn!(
                    request_id,
                    backend = %backend.display_address(),
                    error = %e,
                    "Forward failed, marking backend down"
                );
                json_error_response(ProxyErrorCode::UpstreamUnavailable, "Service Unavailable")
            }
            Err(_) => {
                backend.set_alive(false);
                warn!(
                    request_id,
                    backend = %backend.display_address(),
                    timeout_secs = self.request_timeout.as_secs_f64(),
                    "Request timed out, marking backend down"
                );
                json_error_response(
                    ProxyErrorCode::UpstreamTimeout,
                    format!(
                        "Backend did not respond within {} seconds",
                        self.request_timeout.as_secs_f64()
                    ),
                )
            }
        };

        with_request_id(response, &request_id)
    }
}

/// Inbound request body that records whether reading from the client failed
struct ClientBody {
    inner: ProxyBody,
    failed: Arc<AtomicBool>,
}

impl ClientBody {
    fn new(inner: ProxyBody, failed: Arc<AtomicBool>) -> Self {
        Self { inner, failed }
    }
}

impl Body for ClientBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        if let Poll::Ready(Some(Err(_))) = polled {
            this.failed.store(true, Ordering::Release);
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

/// Echo the request ID back to the client
fn with_request_id(mut response: Response<ProxyBody>, request_id: &str) -> Response<ProxyBody> {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// The load balancer's inbound HTTP server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    router: Router,
    shutdown_rx: watch::Receiver<bool>,
    shutdown_grace: Duration,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, router: Router, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            router,
            shutdown_rx,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// How long in-flight connections may run after shutdown is signalled
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown, then drain
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Load balancer listening (HTTP/1.1 and HTTP/2)");

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder.http1().preserve_header_case(true);
        builder.http2().max_concurrent_streams(250);

        let graceful = GracefulShutdown::new();
        let mut connections = JoinSet::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = self.router.clone();
                            let service = service_fn(move |req: Request<Incoming>| {
                                let router = router.clone();
                                async move {
                                    Ok::<_, Infallible>(router.handle(req.map(|body| body.boxed()), Some(addr)).await)
                                }
                            });

                            let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn.into_owned());
                            connections.spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Load balancer shutting down, no longer accepting connections");
                        break;
                    }
                }
            }
        }

        drop(listener);

        info!(
            open_connections = connections.len(),
            grace_secs = self.shutdown_grace.as_secs_f64(),
            "Draining in-flight connections"
        );

        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections drained");
            }
            _ = tokio::time::sleep(self.shutdown_grace) => {
                warn!(
                    remaining = connections.len(),
                    "Shutdown grace period elapsed, closing remaining connections"
                );
            }
        }

        connections.shutdown().await;
        Ok(())
    }
}
