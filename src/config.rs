use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when `[remote].api_key` is not set.
pub const API_KEY_ENV: &str = "CATALOG_SYNC_API_KEY";

/// Hard upper bound on records per remote call.
pub const MAX_BATCH_SIZE: usize = 50;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RemoteConfig {
    /// The credential from the config file, falling back to [`API_KEY_ENV`].
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

/// How often the trigger loop starts a fresh sync on its own.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Hourly,
    TwiceDaily,
    Daily,
}

impl Frequency {
    pub fn interval(&self) -> Duration {
        match self {
            Frequency::Hourly => Duration::from_secs(60 * 60),
            Frequency::TwiceDaily => Duration::from_secs(12 * 60 * 60),
            Frequency::Daily => Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Category ids; empty means every category.
    #[serde(default)]
    pub categories: Vec<i64>,
    #[serde(default)]
    pub frequency: Frequency,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_direct_threshold")]
    pub direct_threshold: u64,
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_tick_delay_secs")]
    pub tick_delay_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tenant: default_tenant(),
            currency: default_currency(),
            categories: Vec::new(),
            frequency: Frequency::default(),
            batch_size: default_batch_size(),
            direct_threshold: default_direct_threshold(),
            staleness_secs: default_staleness_secs(),
            batch_delay_ms: default_batch_delay_ms(),
            tick_delay_secs: default_tick_delay_secs(),
        }
    }
}

fn default_tenant() -> String {
    "site_1".to_string()
}
fn default_currency() -> String {
    "USD".to_string()
}
fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}
fn default_direct_threshold() -> u64 {
    1000
}
fn default_staleness_secs() -> i64 {
    60 * 60
}
fn default_batch_delay_ms() -> u64 {
    1000
}
fn default_tick_delay_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Trigger loop wake-up interval.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            poll_secs: default_poll_secs(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}
fn default_poll_secs() -> u64 {
    1
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.sync.batch_size == 0 || config.sync.batch_size > MAX_BATCH_SIZE {
        anyhow::bail!("sync.batch_size must be in 1..={}", MAX_BATCH_SIZE);
    }
    if config.sync.direct_threshold == 0 {
        anyhow::bail!("sync.direct_threshold must be > 0");
    }
    if config.sync.staleness_secs < 0 {
        anyhow::bail!("sync.staleness_secs must be >= 0");
    }
    if config.sync.tenant.trim().is_empty() {
        anyhow::bail!("sync.tenant must not be empty");
    }
    if config.remote.timeout_secs == 0 {
        anyhow::bail!("remote.timeout_secs must be > 0");
    }
    if config.server.poll_secs == 0 {
        anyhow::bail!("server.poll_secs must be > 0");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str("[db]\npath = \"./data/catalog.sqlite\"\n").unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sync.batch_size, 50);
        assert_eq!(cfg.sync.direct_threshold, 1000);
        assert_eq!(cfg.sync.staleness_secs, 3600);
        assert_eq!(cfg.sync.frequency, Frequency::Hourly);
        assert!(!cfg.sync.enabled);
        assert_eq!(cfg.remote.timeout_secs, 30);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[sync]\nbatch_size = 51\n").unwrap();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn frequency_parses_lowercase() {
        let cfg: Config =
            toml::from_str("[db]\npath = \"x.sqlite\"\n[sync]\nfrequency = \"twicedaily\"\n")
                .unwrap();
        assert_eq!(cfg.sync.frequency, Frequency::TwiceDaily);
        assert_eq!(cfg.sync.frequency.interval(), Duration::from_secs(43_200));
    }
}
