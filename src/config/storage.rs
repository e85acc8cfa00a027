//! Configuration Storage
//!
//! Reads and writes the console config file.
//! Location: explicit path, then `$DOCKYARD_CONFIG`, then `~/.dockyard/config.json`.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{ConsoleConfig, CONFIG_VERSION};

pub const CONFIG_ENV: &str = "DOCKYARD_CONFIG";

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// `~/.dockyard`
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".dockyard"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Resolve the config file path; `explicit` wins over the environment
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        _ => Ok(config_dir()?.join("config.json")),
    }
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the resolved default location
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: config_path(None)?,
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> ConfigError {
        ConfigError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Load configuration from disk.
    /// A missing file yields the defaults; a malformed one is an error.
    pub async fn load(&self) -> Result<ConsoleConfig, ConfigError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {:?}, using defaults", self.path);
                return Ok(ConsoleConfig::default());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let config: ConsoleConfig =
            serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
                path: self.path.clone(),
                source,
            })?;
        if config.version > CONFIG_VERSION {
            return Err(ConfigError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        tracing::info!(
            "Loaded config from {:?} ({} host(s), {} token(s))",
            self.path,
            config.hosts.len(),
            config.gateway.tokens.len()
        );
        Ok(config)
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &ConsoleConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| self.io_error(e))?;
        }

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config).map_err(|source| ConfigError::Json {
            path: self.path.clone(),
            source,
        })?;

        let mut file = fs::File::create(&temp_path).await.map_err(|e| self.io_error(e))?;
        file.write_all(json.as_bytes()).await.map_err(|e| self.io_error(e))?;
        file.sync_all().await.map_err(|e| self.io_error(e))?;

        fs::rename(&temp_path, &self.path).await.map_err(|e| self.io_error(e))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
