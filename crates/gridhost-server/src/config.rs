use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gridhost_bridge::MAX_WORKER_ID;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const APP_DIR_NAME: &str = "Gridhost";
const CONFIG_FILE: &str = "server.json";
const PLUGIN_CACHE_FILE: &str = "plugins.json";
const SANDBOX_BINARY: &str = "gridhost-sandbox";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config directory unavailable")]
    NoConfigDir,
    #[error("failed to access config at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("server id {id} is out of range (max {max})", max = MAX_WORKER_ID)]
    InvalidServerId { id: u32 },
    #[error("worker port for id {id} overflows base port {base_port}")]
    PortOverflow { id: u32, base_port: u16 },
}

pub fn config_dir() -> Result<PathBuf, ConfigError> {
    let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
    let dir = base.join(APP_DIR_NAME);
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|source| ConfigError::Io {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(dir)
}

/// Persistent server settings. Missing fields fall back to their defaults so
/// older files keep loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub server_id: u32,
    pub sandbox_binary: Option<PathBuf>,
    pub base_port: u16,
    pub plugin_roots: Vec<PathBuf>,
    pub plugin_cache: Option<PathBuf>,
    pub scan_on_restart: bool,
    pub splash_on_start: bool,
    pub launch_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub join_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub restart_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: 0,
            sandbox_binary: None,
            base_port: 55056,
            plugin_roots: Vec::new(),
            plugin_cache: None,
            scan_on_restart: false,
            splash_on_start: true,
            launch_timeout_ms: 5_000,
            stop_timeout_ms: 3_000,
            join_timeout_ms: 5_000,
            poll_interval_ms: 50,
            restart_delay_ms: 250,
        }
    }
}

impl ServerConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(config_dir()?.join(CONFIG_FILE))
    }

    /// Loads the config from the default location, or defaults when no file
    /// exists yet.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects ids the sandbox would refuse and ids whose worker port does
    /// not fit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id > MAX_WORKER_ID {
            return Err(ConfigError::InvalidServerId { id: self.server_id });
        }
        self.worker_port().map(|_| ())
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Port used by the worker with this server's id.
    pub fn worker_port(&self) -> Result<u16, ConfigError> {
        u16::try_from(self.server_id)
            .ok()
            .and_then(|id| self.base_port.checked_add(id))
            .ok_or(ConfigError::PortOverflow {
                id: self.server_id,
                base_port: self.base_port,
            })
    }

    /// Location of the sandbox executable. Defaults to a binary sitting next
    /// to the running server.
    pub fn sandbox_binary(&self) -> PathBuf {
        if let Some(path) = &self.sandbox_binary {
            return path.clone();
        }
        let name = format!("{SANDBOX_BINARY}{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&name)))
            .unwrap_or_else(|| PathBuf::from(name))
    }

    pub fn plugin_cache_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.plugin_cache {
            Some(path) => Ok(path.clone()),
            None => Ok(config_dir()?.join(PLUGIN_CACHE_FILE)),
        }
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}
