//! Configuration loading and persistence.
//!
//! Reads `config.json` from the case-sync config directory and layers
//! environment variable overrides on top. The API token is only ever taken
//! from the environment (or set at runtime) and is never written to disk.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::connection::ConnectionOptions;
use crate::constants;
use crate::reconnect::Backoff;

/// Name of the configuration file inside [`Config::config_dir`].
const CONFIG_FILE: &str = "config.json";

/// Configuration for the case-sync client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// REST base URL of the case-tracking service. The push channel URL is
    /// derived from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    /// Bearer token - NOT serialized to disk.
    #[serde(skip)]
    pub token: String,
    /// Seconds between heartbeat pings.
    pub heartbeat_secs: u64,
    /// Reconnect delay schedule.
    pub reconnect: Backoff,
    /// Seconds an optimistic move may wait for the server.
    pub mutation_timeout_secs: u64,
    /// Application close code for a rejected credential.
    pub unauthorized_close_code: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            token: String::new(),
            heartbeat_secs: constants::HEARTBEAT_INTERVAL.as_secs(),
            reconnect: Backoff::default(),
            mutation_timeout_secs: constants::MUTATION_TIMEOUT.as_secs(),
            unauthorized_close_code: constants::UNAUTHORIZED_CLOSE_CODE,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CASE_SYNC_CONFIG_DIR` overrides the platform config directory
    /// (Linux: `~/.config/case-sync`).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CASE_SYNC_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("case-sync")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = match Self::load_from(&dir) {
            Ok(config) => config,
            Err(e) => {
                log::debug!("[Config] Using defaults: {:#}", e);
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `config.json` from `dir`.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let mut config: Self = serde_json::from_str(&content)
                .with_context(|| format!("Invalid config file {}", config_path.display()))?;
            config.replace_zero_durations();
            Ok(config)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`; unparseable numbers and zero
    /// durations are ignored.
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let positive_secs = |key: &str| -> Option<u64> {
            let value = lookup(key)?.parse().ok()?;
            if value == 0 {
                log::warn!("[Config] Ignoring {}=0", key);
                return None;
            }
            Some(value)
        };

        if let Some(api_url) = lookup("CASE_SYNC_API_URL") {
            self.api_url = Some(api_url);
        }

        if let Some(token) = lookup("CASE_SYNC_TOKEN") {
            self.token = token;
        }

        if let Some(secs) = positive_secs("CASE_SYNC_HEARTBEAT_SECS") {
            self.heartbeat_secs = secs;
        }

        if let Some(secs) = positive_secs("CASE_SYNC_RECONNECT_SECS") {
            self.reconnect = Backoff::Fixed {
                delay: Duration::from_secs(secs),
            };
        }

        if let Some(secs) = positive_secs("CASE_SYNC_MUTATION_TIMEOUT_SECS") {
            self.mutation_timeout_secs = secs;
        }
    }

    /// Zero intervals from the config file fall back to the defaults.
    fn replace_zero_durations(&mut self) {
        let defaults = Self::default();
        if self.heartbeat_secs == 0 {
            log::warn!("[Config] heartbeat_secs is 0, using {}", defaults.heartbeat_secs);
            self.heartbeat_secs = defaults.heartbeat_secs;
        }
        if self.mutation_timeout_secs == 0 {
            log::warn!(
                "[Config] mutation_timeout_secs is 0, using {}",
                defaults.mutation_timeout_secs
            );
            self.mutation_timeout_secs = defaults.mutation_timeout_secs;
        }
        if self.reconnect.delay_for(1).is_some_and(|delay| delay.is_zero()) {
            log::warn!("[Config] Reconnect delay is 0, using the default schedule");
            self.reconnect = defaults.reconnect;
        }
    }

    /// Persists the current configuration to the config directory.
    /// Note: the token is NOT saved.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Writes `config.json` into `dir` with owner-only permissions.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Check if a token is available.
    pub fn has_token(&self) -> bool {
        !self.token.trim().is_empty()
    }

    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Mutation timeout as a [`Duration`].
    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_secs(self.mutation_timeout_secs)
    }

    /// Connection tunables derived from this configuration.
    pub fn to_connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            base_url: self.api_url.clone(),
            heartbeat_interval: self.heartbeat_interval(),
            backoff: self.reconnect,
            unauthorized_close_code: self.unauthorized_close_code,
        }
    }
}
