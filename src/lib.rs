//! Relaygate - An HTTP load balancer over a static backend pool
//!
//! This library provides a reverse proxy that:
//! - Forwards each request to one backend chosen by round-robin or least-connections
//! - Tracks in-flight requests per backend with lock-free counters
//! - Probes every backend's health endpoint on a fixed interval
//! - Marks a backend down as soon as a forward to it fails
//! - Answers 503 immediately when no backend is alive
//! - Drains in-flight requests on graceful shutdown

pub mod admin;
pub mod backend;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod loadbalancer;
pub mod pool;
pub mod proxy;
