//! Error taxonomy for cache operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::runtime::RuntimeError;

/// Errors surfaced by the artifact store, compiled models and the keyed cache.
///
/// Nothing is retried or swallowed internally; every variant reaches the
/// immediate caller.
#[derive(Error, Debug)]
pub enum CacheError {
    /// No model is cached under the key. Add it first.
    #[error("no model cached for key {key}")]
    KeyNotFound { key: String },

    /// The raw model could not be found, read or compiled.
    #[error("failed to compile {}: {source}", raw.display())]
    Compilation {
        raw: PathBuf,
        #[source]
        source: RuntimeError,
    },

    /// Publishing the compiled artifact into the store failed.
    #[error("failed to store artifact at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A compiled artifact, fresh or reused, could not be loaded.
    #[error("failed to load artifact {}: {source}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: RuntimeError,
    },

    /// The runtime rejected the input or failed mid-inference.
    #[error("prediction failed: {source}")]
    Prediction {
        #[source]
        source: RuntimeError,
    },
}

impl CacheError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Storage {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn compilation(raw: impl Into<PathBuf>, source: RuntimeError) -> Self {
        CacheError::Compilation {
            raw: raw.into(),
            source,
        }
    }

    /// Whether the caller can fix the condition without a new raw model.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::KeyNotFound { .. } | CacheError::Storage { .. } | CacheError::Prediction { .. }
        )
    }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
