//! Configuration for ryw
//!
//! Sources, lowest priority first:
//! 1. TOML file named by `RYW_CONFIG` (default `ryw.toml`, optional)
//! 2. `RYW__*` environment variables (`RYW__ROUTING__STATUS_TIMEOUT_MS=100`)
//! 3. `API_PORT`
//!
//! Binaries apply CLI overrides on top of the loaded value.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{Error, Result};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "RYW_CONFIG";
/// Environment variable carrying the listen port
pub const PORT_ENV: &str = "API_PORT";

/// Replica id reserved for the primary in status output
pub const PRIMARY_NAME: &str = "primary";

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Port for the HTTP API
    pub port: Option<u16>,

    /// Host to bind
    #[serde(default = "default_bind_host")]
    pub bind_host: String,

    /// Logging level (when RUST_LOG is unset)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Storage backend
    #[serde(default)]
    pub backend: Backend,

    /// Primary connection URL (postgres backend)
    #[serde(default)]
    pub primary_url: Option<String>,

    /// Static replica set
    #[serde(default = "default_replicas")]
    pub replicas: Vec<ReplicaConfig>,

    /// Credentials provisioned at startup
    #[serde(default = "default_accounts")]
    pub accounts: Vec<String>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub writes: WriteConfig,

    #[serde(default)]
    pub advance: AdvanceConfig,

    #[serde(default)]
    pub memory: MemoryConfig,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_replicas() -> Vec<ReplicaConfig> {
    ["replica-a", "replica-b", "replica-c"]
        .into_iter()
        .map(|id| ReplicaConfig {
            id: id.to_string(),
            url: None,
        })
        .collect()
}

fn default_accounts() -> Vec<String> {
    vec!["user@example.com".to_string()]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process primary with simulated lagging replicas
    #[default]
    Memory,
    /// Postgres primary with streaming replicas
    Postgres,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Memory => write!(f, "memory"),
            Backend::Postgres => write!(f, "postgres"),
        }
    }
}

/// One read replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Name, as recorded in the replica status table
    pub id: String,
    /// Connection URL (postgres backend)
    #[serde(default)]
    pub url: Option<String>,
}

/// Replica selection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Deadline for reading replica statuses before falling back to the primary
    #[serde(default = "default_status_timeout")]
    pub status_timeout_ms: u64,
}

fn default_status_timeout() -> u64 {
    250
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            status_timeout_ms: default_status_timeout(),
        }
    }
}

impl RoutingConfig {
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

/// Serializable write retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteConfig {
    #[serde(default = "default_write_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_write_attempts() -> usize {
    5
}
fn default_initial_backoff() -> u64 {
    10
}
fn default_max_backoff() -> u64 {
    200
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_write_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Post-commit position advance retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceConfig {
    #[serde(default = "default_advance_attempts")]
    pub max_attempts: usize,
}

fn default_advance_attempts() -> usize {
    3
}

impl Default for AdvanceConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_advance_attempts(),
        }
    }
}

/// Simulated replication for the memory backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Age a committed change must reach before replicas apply it
    #[serde(default = "default_replication_lag")]
    pub replication_lag_ms: u64,
    /// Replication stream poll interval
    #[serde(default = "default_replication_tick")]
    pub replication_tick_ms: u64,
}

fn default_replication_lag() -> u64 {
    500
}
fn default_replication_tick() -> u64 {
    50
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            replication_lag_ms: default_replication_lag(),
            replication_tick_ms: default_replication_tick(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: None,
            bind_host: default_bind_host(),
            log_level: default_log_level(),
            backend: Backend::default(),
            primary_url: None,
            replicas: default_replicas(),
            accounts: default_accounts(),
            routing: RoutingConfig::default(),
            writes: WriteConfig::default(),
            advance: AdvanceConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl Config {
    /// Load from the config file and environment.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "ryw.toml".to_string());
        Self::load_from(&path)
    }

    /// Load using an explicit config file path.
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("RYW")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("port", std::env::var(PORT_ENV).ok())?
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.port.is_none() {
            return Err(Error::InvalidConfig(format!("need {}", PORT_ENV)));
        }

        let mut seen = HashSet::new();
        for replica in &self.replicas {
            if replica.id.trim().is_empty() {
                return Err(Error::InvalidConfig("replica id must not be empty".into()));
            }
            if replica.id == PRIMARY_NAME {
                return Err(Error::InvalidConfig(format!(
                    "replica id '{}' is reserved",
                    PRIMARY_NAME
                )));
            }
            if !seen.insert(replica.id.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate replica id '{}'",
                    replica.id
                )));
            }
        }

        if self.writes.max_attempts == 0 || self.advance.max_attempts == 0 {
            return Err(Error::InvalidConfig("max_attempts must be at least 1".into()));
        }

        if self.backend == Backend::Postgres {
            if self.primary_url.is_none() {
                return Err(Error::InvalidConfig("postgres backend needs primary_url".into()));
            }
            if let Some(r) = self.replicas.iter().find(|r| r.url.is_none()) {
                return Err(Error::InvalidConfig(format!(
                    "postgres replica '{}' needs a url",
                    r.id
                )));
            }
        }

        Ok(())
    }

    /// Socket address to listen on.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let port = self
            .port
            .ok_or_else(|| Error::InvalidConfig(format!("need {}", PORT_ENV)))?;
        format!("{}:{}", self.bind_host, port)
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("bad bind address: {}", e)))
    }
}
