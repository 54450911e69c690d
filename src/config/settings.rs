use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::port::PortAllocator;

/// How server URLs are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlMode {
    /// `http://localhost:PORT`
    #[default]
    Port,
    /// `https://NAME.TLD`, served through the reverse proxy
    Subdomain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    pub min: u16,
    pub max: u16,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self { min: 3000, max: 3999 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlSettings {
    pub mode: UrlMode,
    pub tld: String,
}

impl Default for UrlSettings {
    fn default() -> Self {
        Self {
            mode: UrlMode::Port,
            tld: "localhost".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySettings {
    /// Budget for each git/ps/lsof invocation
    pub command_timeout_secs: u64,
    /// How deep a recursive scan descends looking for repositories
    pub max_depth: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            command_timeout_secs: 5,
            max_depth: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where new worktrees go; unset means next to the main checkout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktrees_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_path: Option<PathBuf>,
    pub ports: PortSettings,
    pub urls: UrlSettings,
    pub health: HealthSettings,
    pub discovery: DiscoverySettings,
}

fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?
        .join("grove"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn default_log_dir() -> Result<PathBuf> {
    Ok(config_dir()?.join("logs"))
}

impl Config {
    /// Load from the default location, falling back to defaults.
    pub fn load_default() -> Result<Self> {
        Self::load(&default_config_path()?)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating config directory: {}", dir.display()))?;
        }
        let content = toml::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, content)
            .with_context(|| format!("writing config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.ports.min >= 1, "ports.min must be >= 1");
        anyhow::ensure!(
            self.ports.min <= self.ports.max,
            "ports.min ({}) must be <= ports.max ({})",
            self.ports.min,
            self.ports.max
        );
        anyhow::ensure!(
            self.health.interval_secs >= 1,
            "health.interval_secs must be >= 1"
        );
        anyhow::ensure!(
            self.health.timeout_secs >= 1,
            "health.timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.discovery.command_timeout_secs >= 1,
            "discovery.command_timeout_secs must be >= 1"
        );
        anyhow::ensure!(!self.urls.tld.is_empty(), "urls.tld must not be empty");
        Ok(())
    }

    pub fn allocator(&self) -> Result<PortAllocator> {
        PortAllocator::new(self.ports.min, self.ports.max).context("invalid port range")
    }

    pub fn server_url(&self, name: &str, port: u16) -> String {
        match self.urls.mode {
            UrlMode::Subdomain => format!("https://{}.{}", name, self.urls.tld),
            UrlMode::Port => format!("http://localhost:{}", port),
        }
    }

    pub fn registry_path(&self) -> Result<PathBuf> {
        match &self.registry_path {
            Some(path) => Ok(path.clone()),
            None => crate::persistence::default_registry_path(),
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health.timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery.command_timeout_secs)
    }
}
