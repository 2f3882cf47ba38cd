use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Port assumed for peers given without one.
pub const DEFAULT_PORT: u16 = 1138;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub replication: ReplicationConfig,
    pub mime: MimeConfig,
    pub health: HealthConfig,
    /// Suppress banners and per-request logging
    pub quiet: bool,
    /// Maximum upload size in bytes, unlimited if unset
    pub max_upload_size: Option<u64>,
    /// How long in-flight responses may run after a shutdown signal, unlimited if unset
    pub shutdown_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Peers as `host:port`
    pub peers: Vec<String>,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Timeout for pushes, missing-object checks and forwarded reads (seconds)
    pub http_timeout_secs: u64,
    /// Approximate bytes of paths per missing-object check
    pub missing_batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct MimeConfig {
    pub types_file: Option<String>,
    /// Ignore the built-in tables and use only the types file
    pub no_defaults: bool,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub path: String,
    pub healthy_if_file: Option<String>,
    pub healthy_unless_file: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{DEFAULT_PORT}"),
            data_dir: "/var/lib/content-store".to_string(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            http_timeout_secs: 60,
            missing_batch_size: 256 * 1024,
        }
    }
}

impl Default for MimeConfig {
    fn default() -> Self {
        Self {
            types_file: Some("/etc/mime.types".to_string()),
            no_defaults: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            path: "/_healthy".to_string(),
            healthy_if_file: None,
            healthy_unless_file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            replication: ReplicationConfig::default(),
            mime: MimeConfig::default(),
            health: HealthConfig::default(),
            quiet: false,
            max_upload_size: None,
            shutdown_timeout_secs: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| defaults.node.bind_address.clone());

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| defaults.node.data_dir.clone());

        let peers = match std::env::var("REPLICATE_TO") {
            Ok(value) => parse_peers(&value)?,
            Err(_) => Vec::new(),
        };

        let types_file = match std::env::var("MIME_TYPES_FILE") {
            Ok(path) if path.is_empty() => None,
            Ok(path) => Some(path),
            Err(_) => defaults.mime.types_file.clone(),
        };

        let health_path = std::env::var("HEALTH_CHECK_PATH")
            .map(|p| with_leading_slash(&p))
            .unwrap_or_else(|_| defaults.health.path.clone());

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            replication: ReplicationConfig {
                peers,
                backoff_base_ms: env_number("REPLICATION_BACKOFF_BASE_MS")
                    .unwrap_or(defaults.replication.backoff_base_ms),
                backoff_max_ms: env_number("REPLICATION_BACKOFF_MAX_MS")
                    .unwrap_or(defaults.replication.backoff_max_ms),
                http_timeout_secs: env_number("REPLICATION_HTTP_TIMEOUT_SECS")
                    .unwrap_or(defaults.replication.http_timeout_secs),
                missing_batch_size: env_number("MISSING_BATCH_SIZE")
                    .unwrap_or(defaults.replication.missing_batch_size),
            },
            mime: MimeConfig {
                types_file,
                no_defaults: env_flag("NO_DEFAULT_MIME_TYPES"),
            },
            health: HealthConfig {
                path: health_path,
                healthy_if_file: env_path("HEALTHY_IF_FILE"),
                healthy_unless_file: env_path("HEALTHY_UNLESS_FILE"),
            },
            quiet: env_flag("QUIET"),
            max_upload_size: env_number("MAX_UPLOAD_SIZE"),
            shutdown_timeout_secs: env_number::<u64>("SHUTDOWN_TIMEOUT_SECS")
                .filter(|&secs| secs > 0)
                .or(defaults.shutdown_timeout_secs),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.data_dir.is_empty() {
            return Err(ConfigError::ValidationError(
                "DATA_DIR cannot be empty".to_string(),
            ));
        }

        if self.replication.backoff_base_ms > self.replication.backoff_max_ms {
            return Err(ConfigError::ValidationError(
                "REPLICATION_BACKOFF_BASE_MS cannot exceed REPLICATION_BACKOFF_MAX_MS".to_string(),
            ));
        }

        if self.replication.missing_batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "MISSING_BATCH_SIZE must be greater than zero".to_string(),
            ));
        }

        if !self.health.path.starts_with('/') {
            return Err(ConfigError::ValidationError(
                "HEALTH_CHECK_PATH must start with /".to_string(),
            ));
        }

        if matches!(self.health.path.as_str(), "/" | "/_missing" | "/_statistics") {
            return Err(ConfigError::ValidationError(format!(
                "HEALTH_CHECK_PATH {} is already served",
                self.health.path
            )));
        }

        if self.replication.peers.contains(&self.node.bind_address) {
            tracing::warn!(
                "REPLICATE_TO includes this node's own address {}; objects will be pushed back to it",
                self.node.bind_address
            );
        }

        Ok(())
    }

    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.node.data_dir)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.replication.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.replication.backoff_max_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.http_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_secs.map(Duration::from_secs)
    }
}

/// Parse a comma-separated `host[:port]` list, filling in the default port.
pub fn parse_peers(value: &str) -> Result<Vec<String>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|peer| match peer.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() || port.parse::<u16>().is_err() {
                    Err(ConfigError::ValidationError(format!(
                        "Invalid replication peer address: {peer}"
                    )))
                } else {
                    Ok(peer.to_string())
                }
            }
            None => Ok(format!("{peer}:{DEFAULT_PORT}")),
        })
        .collect()
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn env_path(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|p| !p.is_empty())
        .map(|p| with_leading_slash(&p))
}

/// Sentinel files and the health route are always absolute.
fn with_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
