use crate::loadbalancer::Strategy;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the load balancer
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and transport settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Static backend pool
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Health checking
    #[serde(default)]
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the load balancer listens on (default: 3999)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Port for the status API on 127.0.0.1 (default: 0, disabled)
    #[serde(default)]
    pub admin_port: u16,

    /// Max seconds to wait for a backend's response head (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Seconds in-flight requests get to finish on shutdown (default: 10)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn admin_enabled(&self) -> bool {
        self.admin_port > 0
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            admin_port: 0,
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Backend pool definition.
///
/// Backends are either `count` consecutive ports on `host` starting at
/// `base_port`, or the explicit `addresses` list when it is non-empty.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendsConfig {
    /// Selection strategy for the pool
    #[serde(default)]
    pub strategy: Strategy,

    /// Host shared by the generated backend addresses
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Port of the first backend
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Number of consecutive backends
    #[serde(default = "default_backend_count")]
    pub count: u16,

    /// Explicit backend addresses (host:port or http:// URLs)
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            host: default_backend_host(),
            base_port: default_base_port(),
            count: default_backend_count(),
            addresses: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthConfig {
    /// Run the background health checker (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between probe passes (default: 10)
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Timeout for a single probe in seconds (default: 2)
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Health endpoint path (default: /health)
    #[serde(default = "default_health_path")]
    pub path: String,

    /// Probe every backend once before accepting traffic (default: false)
    #[serde(default)]
    pub probe_on_start: bool,
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            path: default_health_path(),
            probe_on_start: false,
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    3999
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_base_port() -> u16 {
    4000
}

fn default_backend_count() -> u16 {
    3
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    10
}

fn default_health_timeout() -> u64 {
    2
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must not be 0".to_string());
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }

        let backends = &self.backends;
        if backends.addresses.is_empty() {
            if backends.count == 0 {
                errors.push("backends.count must be at least 1".to_string());
            } else if u32::from(backends.base_port) + u32::from(backends.count) - 1 > 65535 {
                errors.push(format!(
                    "backends.base_port {} with count {} exceeds the port range",
                    backends.base_port, backends.count
                ));
            }
        }

        let health = &self.health;
        if health.interval_secs == 0 {
            errors.push("health.interval_secs must be greater than 0".to_string());
        }
        if health.timeout_secs == 0 {
            errors.push("health.timeout_secs must be greater than 0".to_string());
        }
        if health.timeout_secs >= health.interval_secs {
            errors.push(format!(
                "health.timeout_secs ({}) must be shorter than health.interval_secs ({})",
                health.timeout_secs, health.interval_secs
            ));
        }
        if !health.path.starts_with('/') {
            errors.push(format!("health.path '{}' must start with '/'", health.path));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Expand the backend section into address strings, in pool order
    pub fn backend_addresses(&self) -> Vec<String> {
        let backends = &self.backends;
        if !backends.addresses.is_empty() {
            return backends.addresses.clone();
        }

        (0..backends.count)
            .filter_map(|i| backends.base_port.checked_add(i))
            .map(|port| format!("http://{}:{}", backends.host, port))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000
request_timeout_secs = 5

[backends]
strategy = "least_connections"
base_port = 5000
count = 4

[health]
interval_secs = 30
timeout_secs = 3
path = "/healthz"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_port, 9000);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.backends.strategy, Strategy::LeastConnections);
        assert_eq!(config.backends.count, 4);
        assert_eq!(config.health.path, "/healthz");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 3999);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(!config.server.admin_enabled());
        assert_eq!(config.backends.strategy, Strategy::RoundRobin);
        assert_eq!(config.backends.base_port, 4000);
        assert_eq!(config.backends.count, 3);
        assert!(config.health.enabled);
        assert_eq!(config.health.interval(), Duration::from_secs(10));
        assert_eq!(config.health.timeout(), Duration::from_secs(2));
        assert_eq!(config.health.path, "/health");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.shutdown_grace_secs, 10);
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout_secs, 90);
    }

    #[test]
    fn test_consecutive_backend_addresses() {
        let config = Config::default();
        assert_eq!(
            config.backend_addresses(),
            vec![
                "http://127.0.0.1:4000",
                "http://127.0.0.1:4001",
                "http://127.0.0.1:4002",
            ]
        );
    }

    #[test]
    fn test_explicit_addresses_take_precedence() {
        let config: Config = toml::from_str(
            r#"
[backends]
count = 5
addresses = ["10.0.0.1:80", "http://10.0.0.2:8080"]
"#,
        )
        .unwrap();

        assert_eq!(
            config.backend_addresses(),
            vec!["10.0.0.1:80", "http://10.0.0.2:8080"]
        );
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
[backends]
strategy = "random"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_health_timeout_must_be_shorter_than_interval() {
        let mut config = Config::default();
        config.health.timeout_secs = 10;
        config.health.interval_secs = 10;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must be shorter than"));
    }

    #[test]
    fn test_port_range_overflow_rejected() {
        let mut config = Config::default();
        config.backends.base_port = 65534;
        config.backends.count = 3;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("exceeds the port range"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.backends.count = 0;
        config.health.path = "health".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("backends.count"));
        assert!(err.contains("health.path"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relaygate.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 4999

[backends]
base_port = 6000
count = 2
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.port, 4999);
        assert_eq!(config.backend_addresses().len(), 2);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[health]\ninterval_secs = 1\ntimeout_secs = 2\n").unwrap();

        assert!(Config::load(&path).is_err());
    }
}
