//! Configuration for projectroles-sync

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("projectroles-sync")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and config file
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Display name of this site
    #[serde(default = "default_site_name")]
    pub site_name: String,

    /// HTTP API port for the sync export endpoint
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Timeout for pulling snapshots from a source site
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Reconciliation policy
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Policy applied when reconciling a snapshot into the local store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Username of the owner of last resort for roles that cannot be honored
    #[serde(default = "default_owner")]
    pub default_owner: String,

    /// Accept roles for existing non-directory accounts
    #[serde(default)]
    pub allow_local_users: bool,

    /// Maximum delegates per project (0 = unlimited)
    #[serde(default = "default_delegate_limit")]
    pub delegate_limit: u32,
}

fn default_site_name() -> String {
    "projectroles".to_string()
}

fn default_http_port() -> u16 {
    8000
}

fn default_http_timeout() -> u64 {
    60
}

fn default_owner() -> String {
    "admin".to_string()
}

fn default_delegate_limit() -> u32 {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_owner: default_owner(),
            allow_local_users: false,
            delegate_limit: default_delegate_limit(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            site_name: default_site_name(),
            http_port: default_http_port(),
            http_timeout_secs: default_http_timeout(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("projectroles.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }
}
