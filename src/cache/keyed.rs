//! Generic key → compiled model cache.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::compiled::CompiledModel;
use crate::error::{CacheError, Result};
use crate::model::{FeatureProvider, FeatureValue, FromFeatures};
use crate::runtime::PredictionOptions;
use crate::storage::ArtifactStore;

/// Maps caller-chosen keys to compiled models.
///
/// Entries are only created by [`add`](Self::add) and [`set`](Self::set) and
/// live until overwritten or until the cache is dropped. There is no eviction.
/// The map is guarded by a read-write lock, so a cache can be shared across
/// threads; concurrent writes to one key are last-writer-wins.
pub struct ModelCache<K> {
    store: ArtifactStore,
    entries: RwLock<HashMap<K, Arc<CompiledModel>>>,
}

impl<K: fmt::Debug> fmt::Debug for ModelCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read();
        f.debug_struct("ModelCache")
            .field("store", &self.store)
            .field("keys", &entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K> ModelCache<K>
where
    K: Eq + Hash + fmt::Debug,
{
    /// Empty cache backed by `store`.
    pub fn new(store: ArtifactStore) -> Self {
        Self::with_entries(store, HashMap::new())
    }

    /// Cache pre-populated with already-built models. Nothing is compiled.
    pub fn with_entries(store: ArtifactStore, entries: HashMap<K, CompiledModel>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(key, model)| (key, Arc::new(model)))
            .collect();
        Self {
            store,
            entries: RwLock::new(entries),
        }
    }

    /// Build a model for every `(key, raw)` pair.
    ///
    /// Stops at the first failure and returns it; the partially filled cache
    /// is dropped. Artifacts already published for earlier entries stay on disk
    /// and are reused next time.
    pub fn from_models<I, P>(store: ArtifactStore, models: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, P)>,
        P: Into<PathBuf>,
    {
        let cache = Self::new(store);
        for (key, raw) in models {
            cache.add(key, raw)?;
        }
        Ok(cache)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Build a model from `raw` and cache it under `key`, replacing any
    /// previous entry.
    ///
    /// The model is fully built before the map is touched; on failure the cache
    /// is unchanged.
    pub fn add(&self, key: K, raw: impl Into<PathBuf>) -> Result<Arc<CompiledModel>> {
        let raw = raw.into();
        let model = Arc::new(CompiledModel::build(&self.store, &raw)?);
        self.insert(key, Arc::clone(&model));
        Ok(model)
    }

    /// Cache an already-built model under `key`, replacing any previous entry.
    pub fn set(&self, key: K, model: CompiledModel) {
        self.insert(key, Arc::new(model));
    }

    fn insert(&self, key: K, model: Arc<CompiledModel>) {
        let mut entries = self.entries.write();
        debug!(?key, source = ?model.source(), "caching model");
        if let Some(previous) = entries.insert(key, model) {
            debug!(source = ?previous.source(), "replaced cached model");
        }
    }

    /// Model cached under `key`, if any.
    pub fn get(&self, key: &K) -> Option<Arc<CompiledModel>> {
        self.entries.read().get(key).cloned()
    }

    /// Model cached under `key`, or [`CacheError::KeyNotFound`].
    pub fn resolve(&self, key: &K) -> Result<Arc<CompiledModel>> {
        self.get(key).ok_or_else(|| CacheError::KeyNotFound {
            key: format!("{key:?}"),
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the cached keys.
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        self.entries.read().keys().cloned().collect()
    }

    pub fn predict<I, O>(&self, key: &K, input: &I, options: &PredictionOptions) -> Result<O>
    where
        I: FeatureProvider,
        O: FromFeatures,
    {
        self.resolve(key)?.predict(input, options)
    }

    pub fn predict_features<O: FromFeatures>(
        &self,
        key: &K,
        values: HashMap<String, FeatureValue>,
        options: &PredictionOptions,
    ) -> Result<O> {
        self.resolve(key)?.predict_features(values, options)
    }

    pub fn predict_batch<I, O>(
        &self,
        key: &K,
        inputs: &[I],
        options: &PredictionOptions,
    ) -> Result<Vec<O>>
    where
        I: FeatureProvider,
        O: FromFeatures,
    {
        self.resolve(key)?.predict_batch(inputs, options)
    }
}
