use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the telemetry server.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    /// Overridden by `--log-level` when the flag is given.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// WebSocket listener configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Clinical record store configuration.
    #[serde(default)]
    pub record_store: RecordStoreConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address, ":port" binds all interfaces. Default: ":6789".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Route serving the WebSocket upgrade. Default: "/".
    #[serde(default = "default_path")]
    pub path: String,

    /// Per-connection outbound notification queue. Default: 64.
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
}

/// Clinical record store (FHIR REST) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordStoreConfig {
    /// FHIR base URL (e.g., "http://localhost:8080/fhir").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_record_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Maximum concurrent report submissions. Default: 8.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address for the metrics HTTP server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_addr() -> String {
    ":6789".to_string()
}

fn default_path() -> String {
    "/".to_string()
}

fn default_outbound_queue_size() -> usize {
    64
}

fn default_record_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_in_flight() -> usize {
    8
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            record_store: RecordStoreConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            path: default_path(),
            outbound_queue_size: default_outbound_queue_size(),
        }
    }
}

impl Default for RecordStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_record_timeout(),
            headers: HashMap::new(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing YAML")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.record_store.endpoint.is_empty() {
            bail!("record_store.endpoint is required");
        }

        if !self.record_store.endpoint.starts_with("http://")
            && !self.record_store.endpoint.starts_with("https://")
        {
            bail!(
                "record_store.endpoint must be an http(s) URL, got {:?}",
                self.record_store.endpoint
            );
        }

        if self.record_store.timeout.is_zero() {
            bail!("record_store.timeout must be positive");
        }

        if self.record_store.max_in_flight == 0 {
            bail!("record_store.max_in_flight must be positive");
        }

        if self.server.listen_addr.is_empty() {
            bail!("server.listen_addr is required");
        }

        if !self.server.path.starts_with('/') {
            bail!("server.path must start with '/', got {:?}", self.server.path);
        }

        if self.server.outbound_queue_size == 0 {
            bail!("server.outbound_queue_size must be positive");
        }

        if self.health.addr.is_empty() {
            bail!("health.addr is required");
        }

        Ok(())
    }
}

/// Expand the ":port" shorthand to a bind-all address.
pub fn resolve_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}
