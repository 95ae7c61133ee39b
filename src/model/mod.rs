//! Data exchanged with model runtimes.

pub mod features;

pub use features::{FeatureMap, FeatureProvider, FeatureValue, FromFeatures, ModelInput, ModelOutput};
