//! Daemon configuration: YAML file, then environment overrides, then CLI flags.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::p2p::Credentials;

pub const ENV_P2P_KEY: &str = "DVRWATCH_P2P_KEY";
pub const ENV_LISTEN: &str = "DVRWATCH_LISTEN";
pub const ENV_INVENTORY: &str = "DVRWATCH_INVENTORY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listen address.
    pub listen: String,
    /// Inventory CSV path.
    pub inventory: Option<PathBuf>,
    pub scan: ScanConfig,
    pub discovery: DiscoveryConfig,
    pub probe: ProbeConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Gap between the end of one cycle and the start of the next.
    pub interval_secs: u64,
    /// Probe pool size.
    pub concurrency: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub timeout_ms: u64,
    /// Send the `/probe/device` request before `/info/device`.
    pub preflight: bool,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub username: String,
    pub key: Option<String>,
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("username", &self.username)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".into(),
            inventory: None,
            scan: ScanConfig::default(),
            discovery: DiscoveryConfig::default(),
            probe: ProbeConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self { interval_secs: 10, concurrency: 20 }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self { host: "www.easy4ipcloud.com".into(), port: 8800, timeout_ms: 3000 }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self { timeout_ms: 3000, preflight: false }
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self { username: "P2PClient".into(), key: None }
    }
}

impl Config {
    /// `<config_dir>/dvrwatch/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dvrwatch").join("config.yaml"))
    }

    /// Load from `path` (or the default location), then apply env overrides.
    /// An explicit path must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::default_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_yaml(&text).with_context(|| format!("Invalid config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `DVRWATCH_*` overrides; `lookup` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(ENV_P2P_KEY).filter(|k| !k.is_empty()) {
            self.credentials.key = Some(key);
        }
        if let Some(listen) = lookup(ENV_LISTEN).filter(|l| !l.trim().is_empty()) {
            self.listen = listen.trim().to_string();
        }
        if let Some(inv) = lookup(ENV_INVENTORY).filter(|p| !p.trim().is_empty()) {
            self.inventory = Some(PathBuf::from(inv.trim()));
        }
    }

    /// Checks that hold for every command.
    pub fn validate(&self) -> Result<()> {
        if self.scan.concurrency == 0 {
            bail!("scan.concurrency must be at least 1");
        }
        if self.scan.interval_secs == 0 {
            bail!("scan.interval_secs must be at least 1");
        }
        if self.discovery.timeout_ms == 0 || self.probe.timeout_ms == 0 {
            bail!("discovery.timeout_ms and probe.timeout_ms must be greater than 0");
        }
        if self.discovery.host.trim().is_empty() || self.discovery.port == 0 {
            bail!("discovery.host and discovery.port are required");
        }
        if self.credentials.username.is_empty() {
            bail!("credentials.username must not be empty");
        }
        Ok(())
    }

    /// The shared secret, required by every command that talks to devices.
    pub fn credentials(&self) -> Result<Arc<Credentials>> {
        match self.credentials.key.as_deref() {
            Some(key) if !key.is_empty() => Ok(Arc::new(Credentials::new(self.credentials.username.clone(), key))),
            _ => bail!("No P2P key configured (set {} or credentials.key)", ENV_P2P_KEY),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan.interval_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe.timeout_ms)
    }
}
