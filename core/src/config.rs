//! Application configuration.
//!
//! A single TOML file loaded at startup. Everything has a workable default
//! so a bare `rill` run comes up with a local database and no proxy.
//! Settings that change at runtime (fallback user agent, AI language, rate
//! limit) live in the settings table instead, see
//! [`rill_types::settings_keys`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use rill_ai::ProviderConfig;
use rill_fetch::{ClientConfig, IpStack, ProxyConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory; defaults to the platform data dir plus `rill`.
    pub data_dir: Option<PathBuf>,
    /// SQLite file; defaults to `<data_dir>/rill.db`.
    pub database_path: Option<PathBuf>,
    /// Snowflake node ID, 0-1023.
    pub node_id: u64,
    /// Minutes between automatic refresh passes.
    pub refresh_interval_minutes: Option<u64>,
    /// Default user agent for feed polling.
    pub user_agent: Option<String>,
    pub proxy: Option<ProxyConfig>,
    pub ip_stack: IpStack,
    /// Provider block; absent disables summaries and translations.
    pub ai: Option<ProviderConfig>,
}

impl Config {
    pub const DEFAULT_REFRESH_INTERVAL_MINUTES: u64 = 30;

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("rill")
        })
    }

    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("rill.db"))
    }

    #[must_use]
    pub fn icon_dir(&self) -> PathBuf {
        self.data_dir().join("icons")
    }

    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(
            self.refresh_interval_minutes
                .unwrap_or(Self::DEFAULT_REFRESH_INTERVAL_MINUTES)
                .max(1)
                * 60,
        )
    }

    #[must_use]
    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .filter(|ua| !ua.trim().is_empty())
            .unwrap_or_else(|| rill_fetch::DEFAULT_USER_AGENT.to_string())
    }

    #[must_use]
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            proxy: self.proxy.clone(),
            ip_stack: self.ip_stack,
        }
    }
}
