//! CLI configuration management.
//!
//! Configuration is stored at `~/.config/rotacache/config.json` and holds
//! the server URL, an optional API token, and the engine settings. Cached
//! data lives under the platform cache directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rotacache_core::EngineConfig;
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "rotacache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Overrides `server_url` when set.
pub const SERVER_URL_ENV: &str = "ROTACACHE_SERVER_URL";

/// Overrides `token` when set.
pub const TOKEN_ENV: &str = "ROTACACHE_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub engine: EngineConfig,
}

impl Config {
    /// Load from `path`, or the default location when `None`. Environment
    /// overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str::<Self>(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };
        config.engine.validate()?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var(SERVER_URL_ENV).filter(|v| !v.is_empty()) {
            self.server_url = Some(url);
        }
        if let Some(token) = var(TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.token = Some(token);
        }
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn server_url(&self) -> Result<&str> {
        self.server_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!(
                "No server URL configured. Set {} or add \"server_url\" to {}",
                SERVER_URL_ENV,
                CONFIG_FILE
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_file_values() {
        let mut config = Config {
            server_url: Some("http://file".to_string()),
            ..Config::default()
        };
        config.apply_env(|name| match name {
            SERVER_URL_ENV => Some("http://env".to_string()),
            TOKEN_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.server_url.as_deref(), Some("http://env"));
        assert_eq!(config.token, None);
    }

    #[test]
    fn test_missing_url_is_an_error() {
        assert!(Config::default().server_url().is_err());
    }

    #[test]
    fn test_partial_file_uses_engine_defaults() {
        let config: Config = serde_json::from_str(r#"{"server_url": "http://x"}"#).unwrap();
        assert_eq!(config.engine, EngineConfig::default());
    }
}
