//! Configuration management for xair-remote
//!
//! Handles loading, parsing, and hot-reloading of YAML configuration files.
//! Every field has a default, so an empty file is a valid configuration.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::fs;

use crate::discovery::Cidr;
use crate::osc::address::MAX_CHANNEL;
use crate::session::SessionConfig;

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mixer: MixerConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Mixer endpoint and local socket
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MixerConfig {
    /// Manual mixer address; discovery is used when absent
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default = "default_mixer_port")]
    pub port: u16,
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Explicit scan range; all interfaces when absent
    #[serde(default)]
    pub cidr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_channels")]
    pub channels: u8,
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    #[serde(default = "default_true")]
    pub subscribe_meters: bool,
}

/// Fader rate limiting
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Interfaces with larger ranges are skipped in automatic mode
    #[serde(default = "default_max_hosts")]
    pub max_hosts: u64,
    /// Try a broadcast probe before scanning host by host
    #[serde(default = "default_true")]
    pub broadcast_first: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_mixer_port(),
            local_port: default_local_port(),
            cidr: None,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            keepalive_ms: default_keepalive_ms(),
            subscribe_meters: true,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            epsilon: default_epsilon(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_discovery_timeout_ms(),
            max_hosts: default_max_hosts(),
            broadcast_first: true,
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path))?
        };

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config to YAML")?;

        fs::write(path, yaml)
            .await
            .with_context(|| format!("Failed to write config file: {}", path))?;

        Ok(())
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_CHANNEL).contains(&self.session.channels) {
            anyhow::bail!(
                "session.channels must be between 1 and {} (got {})",
                MAX_CHANNEL,
                self.session.channels
            );
        }
        if self.session.keepalive_ms == 0 {
            anyhow::bail!("session.keepalive_ms cannot be 0");
        }
        if self.throttle.period_ms == 0 {
            anyhow::bail!("throttle.period_ms cannot be 0");
        }
        if !(self.throttle.epsilon >= 0.0 && self.throttle.epsilon < 1.0) {
            anyhow::bail!("throttle.epsilon must be in [0, 1) (got {})", self.throttle.epsilon);
        }
        if self.discovery.timeout_ms == 0 {
            anyhow::bail!("discovery.timeout_ms cannot be 0");
        }
        if self.mixer.port == 0 {
            anyhow::bail!("mixer.port cannot be 0");
        }

        self.mixer_target()?;
        self.scan_range()?;

        Ok(())
    }

    /// Manual mixer endpoint, if a host is configured
    pub fn mixer_target(&self) -> Result<Option<SocketAddr>> {
        let Some(host) = self.mixer.host.as_deref().filter(|h| !h.trim().is_empty()) else {
            return Ok(None);
        };
        let ip: IpAddr = host
            .trim()
            .parse()
            .with_context(|| format!("mixer.host is not an IP address: {}", host))?;
        Ok(Some(SocketAddr::new(ip, self.mixer.port)))
    }

    /// Explicit discovery range, if configured
    pub fn scan_range(&self) -> Result<Option<Cidr>> {
        match self.mixer.cidr.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(cidr) => Ok(Some(cidr.parse().context("Invalid mixer.cidr")?)),
            None => Ok(None),
        }
    }

    /// Did anything that decides which mixer we talk to change?
    pub fn endpoint_changed(&self, other: &AppConfig) -> bool {
        self.mixer.host != other.mixer.host
            || self.mixer.port != other.mixer.port
            || self.mixer.cidr != other.mixer.cidr
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            local_port: self.mixer.local_port,
            mixer_port: self.mixer.port,
            channels: self.session.channels,
            keepalive: Duration::from_millis(self.session.keepalive_ms),
            subscribe_meters: self.session.subscribe_meters,
            throttle_period: Duration::from_millis(self.throttle.period_ms),
            throttle_epsilon: self.throttle.epsilon,
            discovery_timeout: Duration::from_millis(self.discovery.timeout_ms),
            discovery_max_hosts: self.discovery.max_hosts,
            ..SessionConfig::default()
        }
    }
}

// Default value functions
fn default_mixer_port() -> u16 { crate::osc::MIXER_PORT }
fn default_local_port() -> u16 { 12000 }
fn default_channels() -> u8 { 8 }
fn default_keepalive_ms() -> u64 { 5000 }
fn default_true() -> bool { true }
fn default_period_ms() -> u64 { 33 }
fn default_epsilon() -> f32 { 0.0005 }
fn default_discovery_timeout_ms() -> u64 { 1500 }
fn default_max_hosts() -> u64 { crate::discovery::DEFAULT_MAX_HOSTS }

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_from_empty_yaml() {
        let config: AppConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.mixer.port, 10024);
        assert_eq!(config.mixer.local_port, 12000);
        assert_eq!(config.session.channels, 8);
        assert_eq!(config.throttle.period_ms, 33);
        assert_eq!(config.discovery.timeout_ms, 1500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections() {
        let yaml = r#"
mixer:
  host: "192.168.1.20"
session:
  channels: 16
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.mixer.port, 10024);
        assert_eq!(config.session.keepalive_ms, 5000);
        assert_eq!(
            config.mixer_target().unwrap(),
            Some("192.168.1.20:10024".parse().unwrap())
        );
        assert_eq!(config.session_config().channels, 16);
    }

    #[test]
    fn test_validation_errors() {
        let mut config = AppConfig::default();
        config.session.channels = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.channels = 33;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.throttle.period_ms = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mixer.host = Some("mixer.local".into());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mixer.cidr = Some("10.0.0.0/40".into());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mixer.cidr = Some("10.0.0.0/24".into());
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_range().unwrap().unwrap().host_count(), 254);
    }

    #[test]
    fn test_endpoint_changed() {
        let a = AppConfig::default();
        let mut b = a.clone();
        b.throttle.period_ms = 50;
        assert!(!a.endpoint_changed(&b));
        b.mixer.host = Some("10.0.0.9".into());
        assert!(a.endpoint_changed(&b));
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.yaml");
        let path = path.to_string_lossy().to_string();

        let mut config = AppConfig::default();
        config.mixer.host = Some("10.1.1.5".into());
        config.session.subscribe_meters = false;
        config.save(&path).await?;

        let loaded = AppConfig::load(&path).await?;
        assert_eq!(loaded, config);
        Ok(())
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, "session:\n  channels: 64\n")?;

        assert!(AppConfig::load(&path.to_string_lossy()).await.is_err());
        assert!(AppConfig::load("/nonexistent/config.yaml").await.is_err());
        Ok(())
    }
}
