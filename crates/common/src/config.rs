//! TOML configuration for opening a safe.
//!
//! ```toml
//! url = "s3://vaults/alice:6b1f.../notes"
//! cache_path = "/var/lib/safebox/cache.sqlite"
//! fork_check_one_in = 8
//!
//! [store]
//! type = "local"
//! path = "/srv/vaults"
//!
//! [lock]
//! timeout_ms = 30000
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::{LockConfig, ObjectStoreConfig, Storage, UploadConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::crypto::Identity;
use crate::safe::{Cache, Safe, SafeError, SafeOptions};

pub const CONFIG_FILE_NAME: &str = "safebox.toml";

fn default_fork_check_one_in() -> u32 {
    8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafeConfig {
    pub url: String,
    /// Where the safe's blobs live; names are rooted at the url path
    #[serde(default)]
    pub store: ObjectStoreConfig,
    /// Local cache database, in memory when unset
    #[serde(default)]
    pub cache_path: Option<PathBuf>,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default = "default_fork_check_one_in")]
    pub fork_check_one_in: u32,
    #[serde(default)]
    pub uploads: UploadConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("toml serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

impl SafeConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            store: ObjectStoreConfig::default(),
            cache_path: None,
            lock: LockConfig::default(),
            fork_check_one_in: default_fork_check_one_in(),
            uploads: UploadConfig::default(),
        }
    }

    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let toml_str = std::fs::read_to_string(path)?;
        Self::from_toml_str(&toml_str)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn options(&self) -> SafeOptions {
        SafeOptions {
            lock: self.lock.clone(),
            fork_check_one_in: self.fork_check_one_in,
            uploads: self.uploads.clone(),
        }
    }
}

impl Safe {
    /// Connect the configured store and cache and open the safe.
    pub async fn from_config(config: &SafeConfig, identity: Identity) -> Result<Self, SafeError> {
        let url = Url::parse(&config.url)
            .map_err(|e| SafeError::InvalidUrl(format!("{}: {}", config.url, e)))?;
        let root = url.path().trim_matches('/');
        let store = Storage::new(config.store.clone()).await?.with_root(root);

        let cache = match &config.cache_path {
            Some(path) => Cache::new(path).await?,
            None => Cache::in_memory().await?,
        };
        Self::open(Arc::new(store), cache, identity, &config.url, config.options()).await
    }
}
