//! One loaded, predict-capable compiled model.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{CacheError, Result};
use crate::model::{FeatureProvider, FeatureValue, FromFeatures, ModelInput};
use crate::runtime::{ModelHandle, PredictionOptions};
use crate::storage::{ArtifactOrigin, ArtifactStore};

/// A runtime handle together with where it came from.
///
/// Immutable once built. Deleting the file at [`destination`](Self::destination)
/// only affects future reuse; this instance keeps predicting.
pub struct CompiledModel {
    source: PathBuf,
    destination: PathBuf,
    origin: ArtifactOrigin,
    handle: Box<dyn ModelHandle>,
}

impl fmt::Debug for CompiledModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModel")
            .field("source", &self.source)
            .field("destination", &self.destination)
            .field("origin", &self.origin)
            .field("outputs", &self.handle.output_names())
            .finish()
    }
}

impl CompiledModel {
    /// Obtain a compiled artifact for `raw` from `store` and load it.
    ///
    /// Fails with whatever [`ArtifactStore::obtain`] fails with, or
    /// [`CacheError::Load`] if the obtained artifact cannot be loaded.
    pub fn build(store: &ArtifactStore, raw: &Path) -> Result<Self> {
        let obtained = store.obtain(raw)?;
        let handle = store.load(&obtained.destination)?;
        debug!(?raw, destination = ?obtained.destination, origin = ?obtained.origin, "model ready");

        Ok(Self {
            source: raw.to_path_buf(),
            destination: obtained.destination,
            origin: obtained.origin,
            handle,
        })
    }

    /// Wrap a handle that was loaded elsewhere.
    pub fn from_parts(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        handle: Box<dyn ModelHandle>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            origin: ArtifactOrigin::Reused,
            handle,
        }
    }

    /// Raw model location this model was built from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Persisted artifact location.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn origin(&self) -> ArtifactOrigin {
        self.origin
    }

    pub fn handle(&self) -> &dyn ModelHandle {
        self.handle.as_ref()
    }

    pub fn output_names(&self) -> Vec<String> {
        self.handle.output_names()
    }

    /// Run one prediction. Every call executes the model.
    pub fn predict<I, O>(&self, input: &I, options: &PredictionOptions) -> Result<O>
    where
        I: FeatureProvider,
        O: FromFeatures,
    {
        self.handle
            .predict(input, options)
            .map(O::from_features)
            .map_err(|source| CacheError::Prediction { source })
    }

    /// Run one prediction from a name → value dictionary.
    pub fn predict_features<O: FromFeatures>(
        &self,
        values: HashMap<String, FeatureValue>,
        options: &PredictionOptions,
    ) -> Result<O> {
        self.predict(&ModelInput::new(values), options)
    }

    /// Run a batch. Outputs follow input order; a runtime failure fails the
    /// whole batch.
    pub fn predict_batch<I, O>(&self, inputs: &[I], options: &PredictionOptions) -> Result<Vec<O>>
    where
        I: FeatureProvider,
        O: FromFeatures,
    {
        let refs: Vec<&dyn FeatureProvider> =
            inputs.iter().map(|input| input as &dyn FeatureProvider).collect();
        let outputs = self
            .handle
            .predict_batch(&refs, options)
            .map_err(|source| CacheError::Prediction { source })?;
        Ok(outputs.into_iter().map(O::from_features).collect())
    }
}
