use relaygate::admin::{AdminServer, PKG_NAME, VERSION};
use relaygate::config::Config;
use relaygate::healthcheck::{HealthCheckConfig, HealthChecker};
use relaygate::loadbalancer::BackendPool;
use relaygate::pool::{ConnectionPool, PoolConfig};
use relaygate::proxy::{ProxyServer, Router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relaygate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = if explicit_path.is_none() && !config_path.exists() {
        warn!(path = %config_path.display(), "No configuration file found, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pool_config = PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: config.server.pool_idle_timeout(),
    };
    let transport = Arc::new(ConnectionPool::new(pool_config));
    let stats = transport.stats();

    let pool = Arc::new(BackendPool::from_addresses(
        &config.backend_addresses(),
        config.backends.strategy,
        transport,
    ));

    if pool.total_count() == 0 {
        warn!("Backend pool is empty, every request will be answered with 503");
    }

    // Health checker
    let health_handle = if config.health.enabled {
        let checker = HealthChecker::new(
            Arc::clone(&pool),
            HealthCheckConfig::from(&config.health),
            shutdown_rx.clone(),
        );

        if config.health.probe_on_start {
            let healthy = checker.probe_all().await;
            info!(healthy, total = pool.total_count(), "Initial health probe complete");
        }

        Some(tokio::spawn(checker.run()))
    } else {
        info!("Health checking disabled, backends stay up until a forward fails");
        None
    };

    // Proxy server
    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let router = Router::new(Arc::clone(&pool), config.server.request_timeout());
    let proxy_server = ProxyServer::new(bind_addr, router, shutdown_rx.clone())
        .with_shutdown_grace(config.server.shutdown_grace());

    // Bind before spawning so a taken port aborts startup
    let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
        error!(addr = %bind_addr, error = %e, "Failed to bind load balancer listener");
        anyhow::anyhow!("Failed to bind {}: {}", bind_addr, e)
    })?;

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.serve(listener).await {
            error!(error = %e, "Proxy server error");
        }
    });

    // Admin server
    let admin_handle = if config.server.admin_enabled() {
        let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port).parse()?;
        let admin_server = AdminServer::new(admin_addr, Arc::clone(&pool), stats, shutdown_rx.clone());
        let admin_listener = TcpListener::bind(admin_addr).await.map_err(|e| {
            error!(addr = %admin_addr, error = %e, "Failed to bind admin listener");
            anyhow::anyhow!("Failed to bind {}: {}", admin_addr, e)
        })?;

        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.serve(admin_listener).await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for servers to stop; the proxy drains within its grace period
    let drain_deadline = config.server.shutdown_grace() + Duration::from_secs(2);
    let drained = tokio::time::timeout(drain_deadline, async {
        let _ = proxy_handle.await;
        if let Some(handle) = health_handle {
            let _ = handle.await;
        }
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    if drained.is_err() {
        warn!("Shutdown deadline passed before all tasks stopped");
    }

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(
        name = PKG_NAME,
        version = VERSION,
        "Starting load balancer"
    );
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_enabled() { Some(config.server.admin_port) } else { None },
        request_timeout_secs = config.server.request_timeout_secs,
        shutdown_grace_secs = config.server.shutdown_grace_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        strategy = %config.backends.strategy,
        backends = ?config.backend_addresses(),
        "Backend pool settings"
    );
    info!(
        enabled = config.health.enabled,
        path = %config.health.path,
        interval_secs = config.health.interval_secs,
        timeout_secs = config.health.timeout_secs,
        probe_on_start = config.health.probe_on_start,
        "Health check settings"
    );
}
