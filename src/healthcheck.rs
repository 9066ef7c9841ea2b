//! Health check system for the backend pool
//!
//! Periodically probes every backend's health endpoint and flips its liveness.
//! A backend is alive only when the probe returns 200 with a JSON body whose
//! `status` field is `"ok"`.

use crate::backend::Backend;
use crate::config::HealthConfig;
use crate::loadbalancer::BackendPool;
use crate::pool::ForwardError;
use futures::future::join_all;
use http_body_util::{BodyExt, Limited};
use hyper::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

/// Upper bound on a health response body
const MAX_HEALTH_BODY_BYTES: usize = 64 * 1024;

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between probe passes
    pub interval: Duration,
    /// Timeout for each probe, including reading the body
    pub timeout: Duration,
    /// Path of the health endpoint
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(2),
            path: "/health".to_string(),
        }
    }
}

impl From<&HealthConfig> for HealthCheckConfig {
    fn from(config: &HealthConfig) -> Self {
        Self {
            interval: config.interval(),
            timeout: config.timeout(),
            path: config.path.clone(),
        }
    }
}

/// Why a probe judged a backend unhealthy
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(#[from] ForwardError),
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("failed to read body: {0}")]
    Body(String),
    #[error("malformed health payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("backend reported status '{0}'")]
    NotOk(String),
}

#[derive(Debug, Deserialize)]
struct HealthPayload {
    status: String,
}

/// Health checker that keeps the pool's liveness flags current
pub struct HealthChecker {
    pool: Arc<BackendPool>,
    config: HealthCheckConfig,
    shutdown_rx: watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(
        pool: Arc<BackendPool>,
        config: HealthCheckConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            config,
            shutdown_rx,
        }
    }

    /// Probe on every interval tick until shutdown is signalled
    pub async fn run(mut self) {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            timeout_secs = self.config.timeout.as_secs_f64(),
            path = %self.config.path,
            "Health checker started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the first pass runs one interval in.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_all().await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Probe every backend concurrently and update liveness.
    /// Returns the number of backends found healthy.
    pub async fn probe_all(&self) -> usize {
        debug!(backends = self.pool.total_count(), "Starting health checks");

        let results = join_all(
            self.pool
                .backends()
                .iter()
                .map(|backend| self.check_backend(backend)),
        )
        .await;

        let healthy = results.into_iter().filter(|alive| *alive).count();
        debug!(healthy, total = self.pool.total_count(), "Health checks completed");
        healthy
    }

    async fn check_backend(&self, backend: &Arc<Backend>) -> bool {
        let was_alive = backend.is_alive();
        let result = self.probe(backend).await;
        let alive = result.is_ok();
        backend.set_alive(alive);

        match (&result, was_alive) {
            (Ok(()), false) => {
                info!(backend = %backend.display_address(), "Backend is now UP");
            }
            (Err(e), true) => {
                warn!(backend = %backend.display_address(), error = %e, "Backend is now DOWN");
            }
            (Err(e), false) => {
                trace!(backend = %backend.display_address(), error = %e, "Backend still down");
            }
            (Ok(()), true) => {}
        }

        alive
    }

    /// Run one probe against `backend` without touching its liveness
    pub async fn probe(&self, backend: &Backend) -> Result<(), ProbeError> {
        let attempt = async {
            let response = backend.probe(&self.config.path).await?;

            if response.status() != StatusCode::OK {
                return Err(ProbeError::Status(response.status()));
            }

            let body = Limited::new(response.into_body(), MAX_HEALTH_BODY_BYTES)
                .collect()
                .await
                .map_err(|e| ProbeError::Body(e.to_string()))?
                .to_bytes();

            let payload: HealthPayload = serde_json::from_slice(&body)?;
            if payload.status != "ok" {
                return Err(ProbeError::NotOk(payload.status));
            }

            Ok::<(), ProbeError>(())
        };

        tokio::time::timeout(self.config.timeout, attempt)
            .await
            .map_err(|_| ProbeError::Timeout(self.config.timeout))?
    }
}
