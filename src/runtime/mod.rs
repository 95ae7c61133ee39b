//! Model runtime boundary.
//!
//! The cache never parses, compiles or executes a model itself. It drives a
//! [`ModelRuntime`] through three calls:
//!
//! - **compile**: raw model description → fresh artifact at a temporary path
//! - **load**: artifact path → [`ModelHandle`]
//! - **predict / predict_batch** on the loaded handle
//!
//! [`linear`] ships a small runtime so the crate works out of the box.

pub mod linear;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::{FeatureMap, FeatureProvider};

pub use linear::LinearRuntime;

/// Errors raised by a runtime. The cache classifies them by the call that
/// produced them, not by variant.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("malformed model description: {0}")]
    Malformed(String),

    #[error("incompatible artifact: {0}")]
    Incompatible(String),

    #[error("corrupt artifact: {0}")]
    Corrupt(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Per-call prediction settings passed through to the runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionOptions {
    /// Fail when the input carries features the model does not declare.
    pub reject_unknown_features: bool,
}

impl PredictionOptions {
    pub fn strict() -> Self {
        Self {
            reject_unknown_features: true,
        }
    }
}

/// A compiler + loader for one model format.
pub trait ModelRuntime: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    /// Compile the raw description at `raw` and return the path of a fresh
    /// artifact. The caller takes ownership of that file.
    fn compile(&self, raw: &Path) -> Result<PathBuf, RuntimeError>;

    /// Load a compiled artifact.
    fn load(&self, artifact: &Path) -> Result<Box<dyn ModelHandle>, RuntimeError>;
}

/// A loaded, ready-to-run model instance.
///
/// Prediction takes `&self`; one handle may serve concurrent callers.
pub trait ModelHandle: Send + Sync {
    /// Names of the features every prediction returns.
    fn output_names(&self) -> Vec<String>;

    fn predict(
        &self,
        input: &dyn FeatureProvider,
        options: &PredictionOptions,
    ) -> Result<FeatureMap, RuntimeError>;

    /// Batch prediction. Whatever the runtime returns is handed to the caller
    /// as-is; the default runs each input in order and stops at the first
    /// failure.
    fn predict_batch(
        &self,
        inputs: &[&dyn FeatureProvider],
        options: &PredictionOptions,
    ) -> Result<Vec<FeatureMap>, RuntimeError> {
        inputs
            .iter()
            .map(|input| self.predict(*input, options))
            .collect()
    }
}
