use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{bail, Context, Result};
use shared::protocol::NODE_SERVICE_TYPE;
use crate::drivers;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub mdns: MdnsConfig,
    #[serde(default)]
    pub ssdp: SsdpConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub modules: ModulesConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsConfig {
    /// Restrict browsing to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SsdpConfig {
    #[serde(default = "default_ssdp_interval")]
    pub interval_secs: u64,
    /// Records not refreshed for interval_secs * removal_units are evicted
    #[serde(default = "default_removal_units")]
    pub removal_units: u32,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModulesConfig {
    /// Driver manifest, resolved against the compiled-in driver table
    #[serde(default = "default_drivers")]
    pub drivers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_service_types() -> Vec<String> {
    vec![NODE_SERVICE_TYPE.to_string()]
}

fn default_ssdp_interval() -> u64 {
    10
}

fn default_removal_units() -> u32 {
    3
}

fn default_probe_timeout() -> u64 {
    3
}

fn default_scan_timeout() -> u64 {
    5
}

fn default_drivers() -> Vec<String> {
    drivers::BUILTIN_DRIVERS
        .iter()
        .map(|entry| entry.id.to_string())
        .collect()
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            interface: None,
            service_types: default_service_types(),
        }
    }
}

impl Default for SsdpConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_ssdp_interval(),
            removal_units: default_removal_units(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl SsdpConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Age after which an unrefreshed record is evicted
    pub fn max_age(&self) -> Duration {
        self.interval().saturating_mul(self.removal_units)
    }

    fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            bail!("ssdp.interval_secs must be at least 1");
        }
        if self.removal_units == 0 {
            bail!("ssdp.removal_units must be at least 1");
        }
        if self.probe_timeout_secs == 0 {
            bail!("ssdp.probe_timeout_secs must be at least 1");
        }
        if self.interval().checked_mul(self.removal_units).is_none() {
            bail!(
                "ssdp.interval_secs * ssdp.removal_units overflows ({} * {})",
                self.interval_secs,
                self.removal_units
            );
        }
        Ok(())
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_scan_timeout(),
        }
    }
}

impl ScanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            drivers: default_drivers(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.ssdp.validate()?;
        Ok(config)
    }
}
