//! Ingestion pipeline configuration.
//!
//! The configuration is read from a single YAML file.  Its top-level
//! sections describe the data source, the shard layout, the backing store
//! and the runtime tuning knobs of the pipeline:
//!
//! ```yaml
//! source:
//!   name: opensky
//!   config: { auth: { user: u, pass: p }, interval: 10 }
//! shards:
//!   prefix: flights_db
//!   copies: 2
//!   extra:
//!     analytics: { tables: 3 }
//! store:
//!   host: localhost
//!   user: postgres
//!   dbname: ingest
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root of the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Which source adapter to poll and its adapter-specific settings.
    pub source: SourceSpec,

    /// Shard layout.
    pub shards: ShardsConfig,

    /// Backing store connection.
    pub store: StoreConfig,

    /// Runtime tuning.
    #[serde(default)]
    pub pipeline: PipelineSettings,
}

impl IngestConfig {
    /// Reads and validates the configuration file at `path`.
    ///
    /// Connection pool defaults are applied here, before anything is built
    /// from the configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let mut config: IngestConfig = serde_yaml::from_str(text)?;
        config.store.connection_pool = config.store.connection_pool.with_defaults();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.name.trim().is_empty() {
            return Err(ConfigError::invalid("source name must not be empty"));
        }
        if self.shards.prefix.is_empty() {
            return Err(ConfigError::invalid("shard prefix must not be empty"));
        }
        if let Some(group) = self.shards.extra.keys().find(|name| name.is_empty()) {
            return Err(ConfigError::invalid(format!(
                "extra shard group name '{group}' must not be empty"
            )));
        }
        if self.pipeline.queue_depth == 0 {
            return Err(ConfigError::invalid("pipeline.queue_depth must be at least 1"));
        }
        self.store.tls.validate()
    }
}

/// Selects a source adapter by its registered name.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SourceSpec {
    pub name: String,

    /// Adapter-specific configuration, passed through verbatim.
    #[serde(default)]
    pub config: YamlValue,
}

/// Shard layout: `copies` primary replicas plus named extra groups.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShardsConfig {
    /// Prefix of every shard name.
    pub prefix: String,

    /// Number of primary replicas, each owning a single table.
    #[serde(default, alias = "replication_count")]
    pub copies: u32,

    /// Extra shard groups, keyed by group name.
    #[serde(default)]
    pub extra: BTreeMap<String, ExtraShardGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct ExtraShardGroup {
    /// Number of tables owned by the group's shard.
    #[serde(default)]
    pub tables: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

/// Backing store connection parameters.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: Option<String>,

    pub dbname: String,

    /// Transport security.  Disabled by default.
    #[serde(default)]
    pub tls: TlsConfig,

    #[serde(default)]
    pub connection_pool: PoolSettings,
}

/// How the connection to the backing store is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Disable,
    /// TLS if the server supports it.
    Prefer,
    /// TLS or fail.
    Require,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,

    /// PEM file with the CA certificates used to verify the server.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,

    /// PEM client certificate; requires `key_file`.
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// PEM client private key; requires `cert_file`.
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Disables certificate verification.
    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Disables hostname verification.
    #[serde(default)]
    pub accept_invalid_hostnames: bool,

    /// Name sent in SNI and checked against the server certificate instead
    /// of `store.host`.
    #[serde(default)]
    pub server_name: Option<String>,

    /// Oldest protocol version offered.
    #[serde(default)]
    pub min_version: Option<TlsVersion>,

    /// Newest protocol version offered.
    #[serde(default)]
    pub max_version: Option<TlsVersion>,

    /// OpenSSL cipher list for TLS 1.2 and older, e.g. `HIGH:!aNULL`.
    #[serde(default)]
    pub ciphers: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1")]
    Tls1_0,
    #[serde(rename = "TLSv1.1")]
    Tls1_1,
    #[serde(rename = "TLSv1.2")]
    Tls1_2,
    #[serde(rename = "TLSv1.3")]
    Tls1_3,
}

impl TlsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == TlsMode::Disable {
            let set = [
                ("ca_file", self.ca_file.is_some()),
                ("cert_file", self.cert_file.is_some()),
                ("key_file", self.key_file.is_some()),
                ("server_name", self.server_name.is_some()),
                ("min_version", self.min_version.is_some()),
                ("max_version", self.max_version.is_some()),
                ("ciphers", self.ciphers.is_some()),
                ("accept_invalid_certs", self.accept_invalid_certs),
                ("accept_invalid_hostnames", self.accept_invalid_hostnames),
            ];
            if let Some((field, _)) = set.iter().find(|(_, is_set)| *is_set) {
                return Err(ConfigError::invalid(format!(
                    "store.tls.{field} is set but store.tls.mode is disable"
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_version, self.max_version) {
            if min > max {
                return Err(ConfigError::invalid(
                    "store.tls.min_version is newer than store.tls.max_version",
                ));
            }
        }
        match (&self.cert_file, &self.key_file) {
            (Some(_), None) => Err(ConfigError::invalid(
                "store.tls.cert_file is set but store.tls.key_file is not",
            )),
            (None, Some(_)) => Err(ConfigError::invalid(
                "store.tls.key_file is set but store.tls.cert_file is not",
            )),
            _ => Ok(()),
        }
    }
}

/// Connection pool sizing.
///
/// A zero value means "unset" and is replaced by the corresponding default
/// in [`PoolSettings::with_defaults`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoolSettings {
    #[serde(default)]
    pub max_open_conns: usize,

    #[serde(default)]
    pub max_idle_conns: usize,

    /// Seconds.
    #[serde(default)]
    pub conn_max_lifetime: u64,

    /// Seconds to wait for a free connection before giving up.
    #[serde(default)]
    pub acquire_timeout: u64,
}

impl PoolSettings {
    pub const DEFAULT_MAX_OPEN_CONNS: usize = 25;
    pub const DEFAULT_MAX_IDLE_CONNS: usize = 25;
    pub const DEFAULT_CONN_MAX_LIFETIME: u64 = 3600;
    pub const DEFAULT_ACQUIRE_TIMEOUT: u64 = 30;

    /// Replaces every zero field with its default.
    pub fn with_defaults(self) -> Self {
        fn or<T: PartialEq + Default>(value: T, default: T) -> T {
            if value == T::default() {
                default
            } else {
                value
            }
        }

        Self {
            max_open_conns: or(self.max_open_conns, Self::DEFAULT_MAX_OPEN_CONNS),
            max_idle_conns: or(self.max_idle_conns, Self::DEFAULT_MAX_IDLE_CONNS),
            conn_max_lifetime: or(self.conn_max_lifetime, Self::DEFAULT_CONN_MAX_LIFETIME),
            acquire_timeout: or(self.acquire_timeout, Self::DEFAULT_ACQUIRE_TIMEOUT),
        }
    }

    pub fn conn_max_lifetime(&self) -> Duration {
        Duration::from_secs(self.conn_max_lifetime)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open_conns: 0,
            max_idle_conns: 0,
            conn_max_lifetime: 0,
            acquire_timeout: 0,
        }
        .with_defaults()
    }
}

fn default_queue_depth() -> usize {
    16
}

fn default_fetch_backoff() -> u64 {
    5
}

fn default_acquire_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    1
}

fn default_health_check_interval() -> u64 {
    60
}

/// Runtime tuning of the pipeline.  Durations are in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PipelineSettings {
    /// Backlog of a table worker, in batches, above which the dispatcher
    /// logs that the worker is falling behind.  Nothing is ever dropped.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Pause after a failed fetch or an invalid poll interval.
    #[serde(default = "default_fetch_backoff")]
    pub fetch_backoff: u64,

    /// How many times a worker retries acquiring a connection, or re-runs a
    /// record after losing its connection.
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,

    /// Pause between those retries.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: u64,

    /// Period of the idle connection health check.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            fetch_backoff: default_fetch_backoff(),
            acquire_retries: default_acquire_retries(),
            retry_backoff: default_retry_backoff(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

impl PipelineSettings {
    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_secs(self.fetch_backoff)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }
}
