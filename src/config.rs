use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the pingwatch monitor.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// InfluxDB connection configuration.
    pub influxdb: InfluxConfig,

    /// Hosts to probe, in the order they are handed to fping.
    pub hosts: Vec<HostEntry>,

    /// Probe process configuration.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// InfluxDB connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct InfluxConfig {
    /// InfluxDB host name or address.
    pub host: String,

    /// InfluxDB HTTP API port.
    pub port: u16,

    /// Target database name. Created on startup when missing.
    pub dbname: String,

    /// InfluxDB username. Empty disables authentication.
    #[serde(default)]
    pub dbuser: String,

    /// InfluxDB password.
    #[serde(default)]
    pub dbpass: String,

    /// Use HTTPS instead of HTTP. Default: false.
    #[serde(default)]
    pub ssl: bool,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// A single monitored host.
#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    /// Host name or IP address passed to fping.
    pub hostaddress: String,
}

/// Probe process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// fping executable name or path. Default: "fping".
    #[serde(default = "default_probe_binary")]
    pub binary: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_probe_binary() -> String {
    "fping".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8086,
            dbname: String::new(),
            dbuser: String::new(),
            dbpass: String::new(),
            ssl: false,
            timeout: default_timeout(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            binary: default_probe_binary(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
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
        if self.influxdb.host.trim().is_empty() {
            bail!("influxdb.host is required");
        }

        if self.influxdb.port == 0 {
            bail!("influxdb.port must be positive");
        }

        if self.influxdb.dbname.trim().is_empty() {
            bail!("influxdb.dbname is required");
        }

        if self.influxdb.timeout.is_zero() {
            bail!("influxdb.timeout must be positive");
        }

        if self.hosts.is_empty() {
            bail!("hosts must list at least one hostaddress");
        }

        for (i, entry) in self.hosts.iter().enumerate() {
            if entry.hostaddress.is_empty() {
                bail!("hosts[{i}].hostaddress is required");
            }

            // fping output is split on whitespace, so the host must be a single token.
            if entry.hostaddress.chars().any(char::is_whitespace) {
                bail!(
                    "hosts[{i}].hostaddress {:?} must not contain whitespace",
                    entry.hostaddress
                );
            }
        }

        if self.probe.binary.trim().is_empty() {
            bail!("probe.binary must not be empty");
        }

        Ok(())
    }

    /// Returns the configured host addresses in declaration order.
    pub fn targets(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.hostaddress.clone()).collect()
    }
}

impl InfluxConfig {
    /// Base URL of the InfluxDB HTTP API (scheme://host:port).
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}
