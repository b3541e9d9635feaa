//! Configuration Storage
//!
//! Reads the bridge tunables from disk.
//! Config location: ~/.vnet-ssh on macOS/Linux, %APPDATA%\VnetSsh on Windows

use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{VnetSshConfig, CONFIG_VERSION};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("VnetSsh"));
        }
        dirs::home_dir()
            .map(|home| home.join(".vnet-ssh"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".vnet-ssh"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the config file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("vnet_ssh.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load configuration from disk
    /// Returns default config if file doesn't exist
    pub async fn load(&self) -> Result<VnetSshConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let config = serde_json::from_str::<VnetSshConfig>(&contents)?;
                if config.version > CONFIG_VERSION {
                    return Err(StorageError::VersionTooNew {
                        found: config.version,
                        supported: CONFIG_VERSION,
                    });
                }
                tracing::debug!(path = ?self.path, "Loaded VNet SSH config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = ?self.path, "No VNet SSH config file, using defaults");
                Ok(VnetSshConfig::default())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save configuration to disk
    pub async fn save(&self, config: &VnetSshConfig) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}
