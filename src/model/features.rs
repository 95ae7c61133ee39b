//! Named feature values exchanged with a model runtime.
//!
//! The cache never looks inside a feature value; it only moves
//! [`FeatureProvider`]s in and [`FeatureMap`]s out. Runtimes decide which
//! variants they accept.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// A single typed feature value.
///
/// Serialized untagged so plain JSON (`{"x": 1.0, "tag": "a"}`) maps onto it
/// directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Int(i64),
    Double(f64),
    String(String),
    MultiArray(Vec<f64>),
}

impl FeatureValue {
    /// Numeric view of the value, if it has one.
    ///
    /// A one-element `MultiArray` counts as a scalar.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Int(v) => Some(*v as f64),
            FeatureValue::Double(v) => Some(*v),
            FeatureValue::MultiArray(values) if values.len() == 1 => Some(values[0]),
            FeatureValue::String(_) | FeatureValue::MultiArray(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FeatureValue::Int(_) => "int",
            FeatureValue::Double(_) => "double",
            FeatureValue::String(_) => "string",
            FeatureValue::MultiArray(_) => "multi-array",
        }
    }
}

impl From<f64> for FeatureValue {
    fn from(value: f64) -> Self {
        FeatureValue::Double(value)
    }
}

impl From<i64> for FeatureValue {
    fn from(value: i64) -> Self {
        FeatureValue::Int(value)
    }
}

impl From<&str> for FeatureValue {
    fn from(value: &str) -> Self {
        FeatureValue::String(value.to_string())
    }
}

impl From<String> for FeatureValue {
    fn from(value: String) -> Self {
        FeatureValue::String(value)
    }
}

impl From<Vec<f64>> for FeatureValue {
    fn from(values: Vec<f64>) -> Self {
        FeatureValue::MultiArray(values)
    }
}

/// Anything that can hand named feature values to a runtime.
pub trait FeatureProvider: Send + Sync {
    /// Names of every feature this provider carries.
    fn feature_names(&self) -> BTreeSet<String>;

    /// Value for `name`, or `None` when the provider has no such feature.
    fn feature_value(&self, name: &str) -> Option<&FeatureValue>;
}

/// Ordered name → value mapping; the runtime's output shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureMap(BTreeMap<String, FeatureValue>);

impl FeatureMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FeatureValue>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&FeatureValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FeatureValue)> {
        self.0.iter()
    }
}

impl FeatureProvider for FeatureMap {
    fn feature_names(&self) -> BTreeSet<String> {
        self.0.keys().cloned().collect()
    }

    fn feature_value(&self, name: &str) -> Option<&FeatureValue> {
        self.0.get(name)
    }
}

impl<S: Into<String>, V: Into<FeatureValue>> FromIterator<(S, V)> for FeatureMap {
    fn from_iter<T: IntoIterator<Item = (S, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        )
    }
}

impl From<HashMap<String, FeatureValue>> for FeatureMap {
    fn from(values: HashMap<String, FeatureValue>) -> Self {
        Self(values.into_iter().collect())
    }
}

/// Dictionary-backed model input.
///
/// Every name must match an input the model declares; unknown names are
/// ignored unless the prediction options ask the runtime to reject them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelInput {
    values: FeatureMap,
}

impl ModelInput {
    pub fn new(values: impl Into<FeatureMap>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn values(&self) -> &FeatureMap {
        &self.values
    }
}

impl FeatureProvider for ModelInput {
    fn feature_names(&self) -> BTreeSet<String> {
        self.values.feature_names()
    }

    fn feature_value(&self, name: &str) -> Option<&FeatureValue> {
        self.values.get(name)
    }
}

impl<S: Into<String>, V: Into<FeatureValue>> FromIterator<(S, V)> for ModelInput {
    fn from_iter<T: IntoIterator<Item = (S, V)>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect::<FeatureMap>())
    }
}

/// Output types built from the feature map a runtime returns.
///
/// Implement this for typed wrappers that pull named fields out of a
/// prediction; [`ModelOutput`] is the untyped default.
pub trait FromFeatures: Sized {
    fn from_features(features: FeatureMap) -> Self;
}

impl FromFeatures for FeatureMap {
    fn from_features(features: FeatureMap) -> Self {
        features
    }
}

/// Untyped prediction output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelOutput {
    features: FeatureMap,
}

impl ModelOutput {
    pub fn features(&self) -> &FeatureMap {
        &self.features
    }

    pub fn into_features(self) -> FeatureMap {
        self.features
    }
}

impl FromFeatures for ModelOutput {
    fn from_features(features: FeatureMap) -> Self {
        Self { features }
    }
}

impl FeatureProvider for ModelOutput {
    fn feature_names(&self) -> BTreeSet<String> {
        self.features.feature_names()
    }

    fn feature_value(&self, name: &str) -> Option<&FeatureValue> {
        self.features.get(name)
    }
}
