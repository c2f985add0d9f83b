//! Configuration loading and persistence.
//!
//! `config.json` in the config directory, overridden by `KEET_WORKLET_*`
//! environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::backend::BackendOptions;
use crate::startup::{StartupArgs, DEFAULT_MODE};

const CONFIG_FILE: &str = "config.json";

/// Configuration for the worklet host.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend storage directory handed to the worklet.
    pub storage_path: PathBuf,
    /// Worklet mode (`experimental` or anything else).
    pub mode: String,
    /// Seconds a handler waits for backend readiness.
    pub readiness_timeout: u64,
    /// Seconds the host waits for any single call. Unset means no deadline.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    /// Worklet restarts the supervisor allows before giving up.
    pub max_restarts: u32,
    /// Milliseconds between a worklet exit and its restart.
    pub restart_delay_ms: u64,
    /// Address the swarm announces.
    pub swarm_host: String,
    /// Port the swarm announces.
    pub swarm_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let storage_path = if crate::env::is_test_mode() {
            std::env::temp_dir().join("keet-worklet-test/storage")
        } else {
            dirs::data_dir()
                .map(|d| d.join("keet/storage"))
                .unwrap_or_else(|| {
                    eprintln!("Warning: Could not determine data directory for storage_path");
                    PathBuf::from("keet-storage")
                })
        };

        Self {
            storage_path,
            mode: DEFAULT_MODE.to_string(),
            readiness_timeout: 30,
            request_timeout: None,
            max_restarts: 3,
            restart_delay_ms: 500,
            swarm_host: "0.0.0.0".to_string(),
            swarm_port: 0,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `<tmp>/keet-worklet-test`
    /// 2. `KEET_WORKLET_CONFIG_DIR` env var: explicit override
    /// 3. `KEET_WORKLET_ENV=test`: `<tmp>/keet-worklet-test`
    /// 4. Default: platform config dir
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                std::env::temp_dir().join("keet-worklet-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("KEET_WORKLET_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_test_mode() {
                    std::env::temp_dir().join("keet-worklet-test")
                } else {
                    dirs::config_dir()
                        .context("Could not determine config directory")?
                        .join("keet-worklet")
                }
            }
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|e| {
            log::debug!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join(CONFIG_FILE);
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)
                .with_context(|| format!("Invalid config at {}", config_path.display()))?)
        } else {
            anyhow::bail!("Config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(storage) = var("KEET_WORKLET_STORAGE") {
            self.storage_path = crate::startup::normalize_storage_path(&storage);
        }

        if let Some(mode) = var("KEET_WORKLET_MODE") {
            self.mode = mode;
        }

        if let Some(timeout) = var("KEET_WORKLET_READINESS_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.readiness_timeout = secs;
            }
        }

        if let Some(timeout) = var("KEET_WORKLET_REQUEST_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.request_timeout = (secs > 0).then_some(secs);
            }
        }

        if let Some(max) = var("KEET_WORKLET_MAX_RESTARTS") {
            if let Ok(max) = max.parse::<u32>() {
                self.max_restarts = max;
            }
        }
    }

    /// Persists the current configuration to disk.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Readiness bound for worklet handlers.
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout)
    }

    /// Per-call deadline for the host client, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout.map(Duration::from_secs)
    }

    /// Delay before the supervisor restarts a dead worklet.
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Startup arguments for the worklet process.
    pub fn startup_args(&self) -> StartupArgs {
        StartupArgs {
            storage_path: self.storage_path.clone(),
            mode: self.mode.clone(),
        }
    }

    /// Backend options for a worklet started with `args`.
    pub fn backend_options(&self, args: &StartupArgs) -> BackendOptions {
        BackendOptions {
            experimental: args.is_experimental(),
            mobile: true,
            swarm_host: self.swarm_host.clone(),
            swarm_port: self.swarm_port,
        }
    }
}
