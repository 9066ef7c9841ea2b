use crate::loadbalancer::BackendPool;
use crate::pool::PoolStats;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the load balancer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// Read-only status API for operators
pub struct AdminServer {
    bind_addr: SocketAddr,
    pool: Arc<BackendPool>,
    stats: Arc<PoolStats>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        pool: Arc<BackendPool>,
        stats: Arc<PoolStats>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            pool,
            stats,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = Arc::clone(&self.pool);
                            let stats = Arc::clone(&self.stats);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, pool, stats).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection<S>(
    stream: S,
    pool: Arc<BackendPool>,
    stats: Arc<PoolStats>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let pool = Arc::clone(&pool);
        let stats = Arc::clone(&stats);
        async move { Ok::<_, hyper::Error>(handle_admin_request(&req, &pool, &stats)) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn handle_admin_request<B>(
    req: &Request<B>,
    pool: &BackendPool,
    stats: &PoolStats,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Admin API request");

    match (method, path) {
        // Liveness of the load balancer itself
        (&Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status":"ok"}"#),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Pool state: strategy, per-backend liveness and load
        (&Method::GET, "/status") => {
            let body = serde_json::json!({
                "pool": pool.status(),
                "requests_proxied": stats.get_total_requests(),
                "upstream_failures": stats.get_upstream_failures(),
                "health_probes": stats.get_health_checks(),
            });
            json_response(StatusCode::OK, body.to_string())
        }

        _ => response(StatusCode::NOT_FOUND, "not found"),
    }
}
