//! Artifact store configuration.
//!
//! Precedence, lowest first: built-in defaults, TOML file, environment
//! (`CAMEL_STORE_DIR`, `CAMEL_NAMING`), then whatever the caller sets
//! explicitly (CLI flags).
//!
//! ```toml
//! root = "/var/lib/camel/compiled-models"
//! naming = "fingerprint"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::DestinationNaming;

/// Environment variable overriding the storage root.
pub const ENV_STORE_DIR: &str = "CAMEL_STORE_DIR";

/// Environment variable overriding the destination naming scheme.
pub const ENV_NAMING: &str = "CAMEL_NAMING";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid CAMEL_NAMING: {0}")]
    InvalidNaming(String),
}

/// Where compiled artifacts live and how their file names are derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage root holding one artifact file per destination name.
    pub root: PathBuf,
    pub naming: DestinationNaming,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_dir(),
            naming: DestinationNaming::default(),
        }
    }
}

impl StoreConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Read a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.with_env()
    }

    /// Apply `CAMEL_STORE_DIR` / `CAMEL_NAMING` on top of `self`.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(dir) = dotenvy::var(ENV_STORE_DIR)
            && !dir.trim().is_empty()
        {
            self.root = PathBuf::from(dir);
        }

        if let Ok(val) = dotenvy::var(ENV_NAMING) {
            self.naming = val.parse().map_err(ConfigError::InvalidNaming)?;
        }

        Ok(self)
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_naming(mut self, naming: DestinationNaming) -> Self {
        self.naming = naming;
        self
    }
}

/// `<platform data dir>/compiled-models`.
pub fn default_store_dir() -> PathBuf {
    crate::default_data_dir().join("compiled-models")
}
