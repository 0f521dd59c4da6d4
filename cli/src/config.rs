// Configuration management for the parley CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/parley/config.json
// - Linux: ~/.config/parley/config.json
// - Windows: %APPDATA%\parley\config.json

use anyhow::{Context, Result};
use parley_core::{DirectoryConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker the directory and chat clients connect to
    pub broker_addr: String,

    /// Address the broker listens on
    pub listen_addr: String,

    /// How long a client waits for a registration result
    pub register_timeout_ms: u64,

    /// How long a client waits for an address reply
    pub resolve_timeout_ms: u64,

    /// Address cache re-check interval while resolving
    pub poll_interval_ms: u64,

    /// Pause between the disconnect notice and closing the link
    pub flush_grace_ms: u64,

    /// Where received files are written (current directory if unset)
    pub download_dir: Option<String>,

    /// Directory capacity
    pub max_clients: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_addr: "127.0.0.1:1883".to_string(),
            listen_addr: "127.0.0.1:1883".to_string(),
            register_timeout_ms: 2000,
            resolve_timeout_ms: 3000,
            poll_interval_ms: 100,
            flush_grace_ms: 1000,
            download_dir: None,
            max_clients: 1000,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("parley");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first run
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Set a config value and persist it
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()
    }

    /// Set a config value in memory only
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "broker_addr" => self.broker_addr = value.to_string(),
            "listen_addr" => self.listen_addr = value.to_string(),
            "register_timeout_ms" => {
                self.register_timeout_ms = value.parse().context("Invalid number")?;
            }
            "resolve_timeout_ms" => {
                self.resolve_timeout_ms = value.parse().context("Invalid number")?;
            }
            "poll_interval_ms" => {
                let interval: u64 = value.parse().context("Invalid number")?;
                if interval == 0 {
                    anyhow::bail!("poll_interval_ms must be greater than zero");
                }
                self.poll_interval_ms = interval;
            }
            "flush_grace_ms" => {
                self.flush_grace_ms = value.parse().context("Invalid number")?;
            }
            "download_dir" => {
                self.download_dir = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            "max_clients" => {
                self.max_clients = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "broker_addr" => Some(self.broker_addr.clone()),
            "listen_addr" => Some(self.listen_addr.clone()),
            "register_timeout_ms" => Some(self.register_timeout_ms.to_string()),
            "resolve_timeout_ms" => Some(self.resolve_timeout_ms.to_string()),
            "poll_interval_ms" => Some(self.poll_interval_ms.to_string()),
            "flush_grace_ms" => Some(self.flush_grace_ms.to_string()),
            "download_dir" => self.download_dir.clone(),
            "max_clients" => Some(self.max_clients.to_string()),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("broker_addr".to_string(), self.broker_addr.clone()),
            ("listen_addr".to_string(), self.listen_addr.clone()),
            ("register_timeout_ms".to_string(), self.register_timeout_ms.to_string()),
            ("resolve_timeout_ms".to_string(), self.resolve_timeout_ms.to_string()),
            ("poll_interval_ms".to_string(), self.poll_interval_ms.to_string()),
            ("flush_grace_ms".to_string(), self.flush_grace_ms.to_string()),
            (
                "download_dir".to_string(),
                self.download_dir.clone().unwrap_or_else(|| "(current dir)".to_string()),
            ),
            ("max_clients".to_string(), self.max_clients.to_string()),
        ]
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            register_timeout: Duration::from_millis(self.register_timeout_ms),
            resolve_timeout: Duration::from_millis(self.resolve_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            flush_grace: Duration::from_millis(self.flush_grace_ms),
            download_dir: PathBuf::from(self.download_dir.as_deref().unwrap_or(".")),
        }
    }

    pub fn directory_config(&self) -> DirectoryConfig {
        DirectoryConfig {
            max_clients: self.max_clients,
        }
    }
}
