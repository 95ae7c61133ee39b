//! Linear model runtime.
//!
//! A raw model is a JSON description of one or more affine outputs over a
//! fixed list of numeric inputs, each followed by an activation, with an
//! optional thresholded label:
//!
//! ```json
//! {
//!   "name": "spam",
//!   "inputs": ["links", "caps_ratio"],
//!   "outputs": [
//!     { "name": "score", "weights": { "links": 0.8, "caps_ratio": 2.0 },
//!       "bias": -1.5, "activation": "sigmoid" }
//!   ],
//!   "label": { "name": "classLabel", "output": "score", "threshold": 0.5,
//!              "below": "ham", "above": "spam" }
//! }
//! ```
//!
//! Compilation lowers the description to dense weight rows and writes a
//! binary artifact:
//!
//! | Field | Size |
//! |-------|------|
//! | magic `CMLA` | 4 |
//! | format version (LE) | 2 |
//! | payload length (LE) | 8 |
//! | payload (JSON) | n |
//! | CRC32 of payload (LE) | 4 |
//!
//! Loading rejects a wrong magic, a different format version, a truncated
//! file or a checksum mismatch, so a stale or damaged artifact is recompiled
//! instead of used.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{ModelHandle, ModelRuntime, PredictionOptions, RuntimeError};
use crate::model::{FeatureMap, FeatureProvider};

/// Magic bytes for linear artifacts.
pub const ARTIFACT_MAGIC: [u8; 4] = *b"CMLA";

/// Artifact format version. Artifacts with any other version fail to load.
pub const ARTIFACT_VERSION: u16 = 1;

/// Upper bound on the payload a loader will allocate for.
const MAX_PAYLOAD_BYTES: u64 = 256 * 1024 * 1024;

/// Activation applied to an output's affine sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Identity,
    Relu,
    Sigmoid,
    Tanh,
}

impl Activation {
    fn apply(self, z: f64) -> f64 {
        match self {
            Activation::Identity => z,
            Activation::Relu => z.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-z).exp()),
            Activation::Tanh => z.tanh(),
        }
    }
}

/// Raw (uncompiled) model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<OutputSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<LabelSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    /// Missing inputs have weight 0.
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub bias: f64,
    #[serde(default)]
    pub activation: Activation,
}

/// String label chosen by comparing one output against a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelSpec {
    pub name: String,
    pub output: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    pub below: String,
    pub above: String,
}

fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CompiledOutput {
    name: String,
    weights: Vec<f64>,
    bias: f64,
    activation: Activation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CompiledLabel {
    name: String,
    output_index: usize,
    threshold: f64,
    below: String,
    above: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CompiledLinear {
    name: String,
    inputs: Vec<String>,
    outputs: Vec<CompiledOutput>,
    label: Option<CompiledLabel>,
}

impl CompiledLinear {
    fn lower(description: ModelDescription) -> Result<Self, RuntimeError> {
        let ModelDescription {
            name,
            inputs,
            outputs,
            label,
        } = description;

        if inputs.is_empty() {
            return Err(RuntimeError::Malformed(format!(
                "model '{name}' declares no inputs"
            )));
        }
        if outputs.is_empty() {
            return Err(RuntimeError::Malformed(format!(
                "model '{name}' declares no outputs"
            )));
        }
        let mut seen = HashSet::new();
        for input in &inputs {
            if !seen.insert(input.as_str()) {
                return Err(RuntimeError::Malformed(format!(
                    "duplicate input '{input}'"
                )));
            }
        }

        let mut output_names = HashSet::new();
        let mut compiled_outputs = Vec::with_capacity(outputs.len());
        for output in outputs {
            if !output_names.insert(output.name.clone()) {
                return Err(RuntimeError::Malformed(format!(
                    "duplicate output '{}'",
                    output.name
                )));
            }
            if let Some(unknown) = output.weights.keys().find(|k| !seen.contains(k.as_str())) {
                return Err(RuntimeError::Malformed(format!(
                    "output '{}' weights undeclared input '{unknown}'",
                    output.name
                )));
            }
            if !output.bias.is_finite() || output.weights.values().any(|w| !w.is_finite()) {
                return Err(RuntimeError::Malformed(format!(
                    "output '{}' has non-finite parameters",
                    output.name
                )));
            }
            let weights = inputs
                .iter()
                .map(|input| output.weights.get(input).copied().unwrap_or(0.0))
                .collect();
            compiled_outputs.push(CompiledOutput {
                name: output.name,
                weights,
                bias: output.bias,
                activation: output.activation,
            });
        }

        let label = match label {
            Some(spec) => {
                if output_names.contains(&spec.name) {
                    return Err(RuntimeError::Malformed(format!(
                        "label '{}' collides with an output name",
                        spec.name
                    )));
                }
                if !spec.threshold.is_finite() {
                    return Err(RuntimeError::Malformed(format!(
                        "label '{}' has a non-finite threshold",
                        spec.name
                    )));
                }
                let output_index = compiled_outputs
                    .iter()
                    .position(|o| o.name == spec.output)
                    .ok_or_else(|| {
                        RuntimeError::Malformed(format!(
                            "label '{}' refers to unknown output '{}'",
                            spec.name, spec.output
                        ))
                    })?;
                Some(CompiledLabel {
                    name: spec.name,
                    output_index,
                    threshold: spec.threshold,
                    below: spec.below,
                    above: spec.above,
                })
            }
            None => None,
        };

        Ok(Self {
            name,
            inputs,
            outputs: compiled_outputs,
            label,
        })
    }

    /// Structural checks shared by compile and load.
    fn validate(&self) -> Result<(), RuntimeError> {
        for output in &self.outputs {
            if output.weights.len() != self.inputs.len() {
                return Err(RuntimeError::Corrupt(format!(
                    "output '{}' has {} weights for {} inputs",
                    output.name,
                    output.weights.len(),
                    self.inputs.len()
                )));
            }
        }
        if let Some(label) = &self.label
            && label.output_index >= self.outputs.len()
        {
            return Err(RuntimeError::Corrupt(format!(
                "label '{}' points past the last output",
                label.name
            )));
        }
        Ok(())
    }

    fn write_to<W: Write>(&self, mut writer: W) -> Result<(), RuntimeError> {
        let payload = serde_json::to_vec(self)?;
        writer.write_all(&ARTIFACT_MAGIC)?;
        writer.write_all(&ARTIFACT_VERSION.to_le_bytes())?;
        writer.write_all(&(payload.len() as u64).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        writer.flush()?;
        Ok(())
    }

    fn read_from<R: Read>(mut reader: R) -> Result<Self, RuntimeError> {
        let magic: [u8; 4] = read_array(&mut reader)?;
        if magic != ARTIFACT_MAGIC {
            return Err(RuntimeError::Corrupt(format!("invalid magic: {magic:?}")));
        }

        let version = u16::from_le_bytes(read_array(&mut reader)?);
        if version != ARTIFACT_VERSION {
            return Err(RuntimeError::Incompatible(format!(
                "artifact format version {version}, runtime expects {ARTIFACT_VERSION}"
            )));
        }

        let payload_len = u64::from_le_bytes(read_array(&mut reader)?);
        if payload_len > MAX_PAYLOAD_BYTES {
            return Err(RuntimeError::Corrupt(format!(
                "payload length {payload_len} exceeds limit"
            )));
        }
        let mut payload = vec![0u8; payload_len as usize];
        reader.read_exact(&mut payload).map_err(truncated)?;

        let expected = u32::from_le_bytes(read_array(&mut reader)?);
        let actual = crc32fast::hash(&payload);
        if expected != actual {
            return Err(RuntimeError::Corrupt(format!(
                "checksum mismatch: stored {expected:08x}, computed {actual:08x}"
            )));
        }

        let compiled: Self = serde_json::from_slice(&payload)?;
        compiled.validate()?;
        Ok(compiled)
    }
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N], RuntimeError> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf).map_err(truncated)?;
    Ok(buf)
}

fn truncated(err: std::io::Error) -> RuntimeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        RuntimeError::Corrupt("truncated artifact".to_string())
    } else {
        RuntimeError::Io(err)
    }
}

/// Runtime for [`ModelDescription`] JSON files.
#[derive(Debug, Clone)]
pub struct LinearRuntime {
    scratch_dir: PathBuf,
}

impl Default for LinearRuntime {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
        }
    }
}

impl LinearRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write fresh artifacts under `dir` instead of the system temp dir.
    pub fn with_scratch_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: dir.into(),
        }
    }
}

impl ModelRuntime for LinearRuntime {
    fn name(&self) -> &str {
        "linear"
    }

    fn compile(&self, raw: &Path) -> Result<PathBuf, RuntimeError> {
        let text = std::fs::read_to_string(raw)?;
        let description: ModelDescription = serde_json::from_str(&text)?;
        let compiled = CompiledLinear::lower(description)?;
        compiled.validate()?;

        std::fs::create_dir_all(&self.scratch_dir)?;
        let file = tempfile::Builder::new()
            .prefix("camel-compile-")
            .suffix(".cmla")
            .tempfile_in(&self.scratch_dir)?;
        compiled.write_to(BufWriter::new(file.as_file()))?;
        file.as_file().sync_all()?;
        let (_, path) = file.keep().map_err(|e| RuntimeError::Io(e.error))?;

        tracing::debug!(model = %compiled.name, ?path, "compiled linear model");
        Ok(path)
    }

    fn load(&self, artifact: &Path) -> Result<Box<dyn ModelHandle>, RuntimeError> {
        let file = File::open(artifact)?;
        let compiled = CompiledLinear::read_from(BufReader::new(file))?;
        Ok(Box::new(LinearModel { compiled }))
    }
}

/// A loaded linear model.
#[derive(Debug)]
pub struct LinearModel {
    compiled: CompiledLinear,
}

impl LinearModel {
    fn gather_inputs(
        &self,
        input: &dyn FeatureProvider,
        options: &PredictionOptions,
    ) -> Result<Vec<f64>, RuntimeError> {
        if options.reject_unknown_features {
            let unknown: Vec<String> = input
                .feature_names()
                .into_iter()
                .filter(|name| !self.compiled.inputs.contains(name))
                .collect();
            if !unknown.is_empty() {
                return Err(RuntimeError::InvalidInput(format!(
                    "unknown features: {}",
                    unknown.join(", ")
                )));
            }
        }

        self.compiled
            .inputs
            .iter()
            .map(|name| {
                let value = input.feature_value(name).ok_or_else(|| {
                    RuntimeError::InvalidInput(format!("missing feature '{name}'"))
                })?;
                value.as_f64().ok_or_else(|| {
                    RuntimeError::InvalidInput(format!(
                        "feature '{name}' must be numeric, got {}",
                        value.kind()
                    ))
                })
            })
            .collect()
    }
}

impl ModelHandle for LinearModel {
    fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.compiled.outputs.iter().map(|o| o.name.clone()).collect();
        if let Some(label) = &self.compiled.label {
            names.push(label.name.clone());
        }
        names
    }

    fn predict(
        &self,
        input: &dyn FeatureProvider,
        options: &PredictionOptions,
    ) -> Result<FeatureMap, RuntimeError> {
        let x = self.gather_inputs(input, options)?;

        let mut features = FeatureMap::new();
        let mut activations = Vec::with_capacity(self.compiled.outputs.len());
        for output in &self.compiled.outputs {
            let z: f64 = output
                .weights
                .iter()
                .zip(&x)
                .map(|(w, v)| w * v)
                .sum::<f64>()
                + output.bias;
            let value = output.activation.apply(z);
            if !value.is_finite() {
                return Err(RuntimeError::InvalidInput(format!(
                    "output '{}' is not finite for this input",
                    output.name
                )));
            }
            features.insert(output.name.clone(), value);
            activations.push(value);
        }

        if let Some(label) = &self.compiled.label {
            let score = activations.get(label.output_index).copied().ok_or_else(|| {
                RuntimeError::Corrupt(format!("label '{}' has no source output", label.name))
            })?;
            let class = if score >= label.threshold {
                &label.above
            } else {
                &label.below
            };
            features.insert(label.name.clone(), class.clone());
        }

        Ok(features)
    }

    fn predict_batch(
        &self,
        inputs: &[&dyn FeatureProvider],
        options: &PredictionOptions,
    ) -> Result<Vec<FeatureMap>, RuntimeError> {
        inputs
            .par_iter()
            .map(|input| self.predict(*input, options))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FeatureValue, ModelInput};
    use tempfile::TempDir;

    fn classifier() -> ModelDescription {
        ModelDescription {
            name: "classifier".into(),
            inputs: vec!["x".into(), "y".into()],
            outputs: vec![OutputSpec {
                name: "score".into(),
                weights: BTreeMap::from([("x".to_string(), 2.0), ("y".to_string(), -1.0)]),
                bias: 0.5,
                activation: Activation::Identity,
            }],
            label: Some(LabelSpec {
                name: "classLabel".into(),
                output: "score".into(),
                threshold: 1.0,
                below: "low".into(),
                above: "high".into(),
            }),
        }
    }

    fn write_raw(dir: &Path, description: &ModelDescription) -> PathBuf {
        let path = dir.join("classifier.json");
        std::fs::write(&path, serde_json::to_string(description).unwrap()).unwrap();
        path
    }

    fn compile_and_load(tmp: &TempDir) -> (PathBuf, Box<dyn ModelHandle>) {
        let runtime = LinearRuntime::with_scratch_dir(tmp.path().join("scratch"));
        let raw = write_raw(tmp.path(), &classifier());
        let artifact = runtime.compile(&raw).unwrap();
        let handle = runtime.load(&artifact).unwrap();
        (artifact, handle)
    }

    #[test]
    fn compiles_loads_and_predicts() {
        let tmp = TempDir::new().unwrap();
        let (artifact, handle) = compile_and_load(&tmp);
        assert!(artifact.starts_with(tmp.path().join("scratch")));

        let input: ModelInput = [("x", 1.0), ("y", 0.5)].into_iter().collect();
        let out = handle.predict(&input, &PredictionOptions::default()).unwrap();
        assert_eq!(out.get("score"), Some(&FeatureValue::Double(2.0)));
        assert_eq!(out.get("classLabel"), Some(&FeatureValue::String("high".into())));
        assert_eq!(handle.output_names(), vec!["score", "classLabel"]);
    }

    #[test]
    fn integer_inputs_are_accepted() {
        let tmp = TempDir::new().unwrap();
        let (_, handle) = compile_and_load(&tmp);
        let input: ModelInput = [("x", FeatureValue::Int(0)), ("y", FeatureValue::Int(0))]
            .into_iter()
            .collect();
        let out = handle.predict(&input, &PredictionOptions::default()).unwrap();
        assert_eq!(out.get("classLabel"), Some(&FeatureValue::String("low".into())));
    }

    #[test]
    fn missing_and_non_numeric_inputs_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let (_, handle) = compile_and_load(&tmp);

        let missing: ModelInput = [("x", 1.0)].into_iter().collect();
        let err = handle.predict(&missing, &PredictionOptions::default()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidInput(ref m) if m.contains("'y'")));

        let text: ModelInput = [("x", FeatureValue::from(1.0)), ("y", FeatureValue::from("nope"))]
            .into_iter()
            .collect();
        let err = handle.predict(&text, &PredictionOptions::default()).unwrap_err();
        assert!(err.to_string().contains("numeric"));
    }

    #[test]
    fn strict_options_reject_unknown_features() {
        let tmp = TempDir::new().unwrap();
        let (_, handle) = compile_and_load(&tmp);
        let input: ModelInput = [("x", 1.0), ("y", 1.0), ("z", 1.0)].into_iter().collect();

        assert!(handle.predict(&input, &PredictionOptions::default()).is_ok());
        let err = handle.predict(&input, &PredictionOptions::strict()).unwrap_err();
        assert!(err.to_string().contains("unknown features: z"));
    }

    #[test]
    fn batch_preserves_order_and_fails_as_a_whole() {
        let tmp = TempDir::new().unwrap();
        let (_, handle) = compile_and_load(&tmp);
        let inputs: Vec<ModelInput> = (0..16)
            .map(|i| [("x", f64::from(i)), ("y", 0.0)].into_iter().collect())
            .collect();
        let refs: Vec<&dyn FeatureProvider> =
            inputs.iter().map(|i| i as &dyn FeatureProvider).collect();
        let outs = handle.predict_batch(&refs, &PredictionOptions::default()).unwrap();
        assert_eq!(outs.len(), 16);
        for (i, out) in outs.iter().enumerate() {
            assert_eq!(out.get("score"), Some(&FeatureValue::Double(2.0 * i as f64 + 0.5)));
        }

        let bad: ModelInput = [("x", 1.0)].into_iter().collect();
        let mut refs = refs;
        refs.push(&bad);
        assert!(handle.predict_batch(&refs, &PredictionOptions::default()).is_err());
    }

    #[test]
    fn malformed_descriptions_fail_to_compile() {
        let tmp = TempDir::new().unwrap();
        let runtime = LinearRuntime::with_scratch_dir(tmp.path());

        let mut undeclared = classifier();
        undeclared.outputs[0].weights.insert("w".into(), 1.0);
        let raw = write_raw(tmp.path(), &undeclared);
        assert!(matches!(runtime.compile(&raw), Err(RuntimeError::Malformed(_))));

        let mut dangling_label = classifier();
        dangling_label.label.as_mut().unwrap().output = "missing".into();
        let raw = write_raw(tmp.path(), &dangling_label);
        assert!(matches!(runtime.compile(&raw), Err(RuntimeError::Malformed(_))));

        std::fs::write(&raw, "{ not json").unwrap();
        assert!(matches!(runtime.compile(&raw), Err(RuntimeError::Json(_))));

        let absent = tmp.path().join("absent.json");
        assert!(matches!(runtime.compile(&absent), Err(RuntimeError::Io(_))));
    }

    #[test]
    fn non_finite_label_threshold_is_rejected() {
        for threshold in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let mut description = classifier();
            description.label.as_mut().unwrap().threshold = threshold;
            let err = CompiledLinear::lower(description).unwrap_err();
            assert!(
                matches!(err, RuntimeError::Malformed(ref m) if m.contains("threshold")),
                "threshold {threshold}: got {err:?}"
            );
        }
    }

    #[test]
    fn load_rejects_damaged_artifacts() {
        let tmp = TempDir::new().unwrap();
        let (artifact, _) = compile_and_load(&tmp);
        let runtime = LinearRuntime::new();
        let pristine = std::fs::read(&artifact).unwrap();

        let mut flipped = pristine.clone();
        let mid = 14 + (flipped.len() - 18) / 2;
        flipped[mid] ^= 0xff;
        std::fs::write(&artifact, &flipped).unwrap();
        assert!(matches!(runtime.load(&artifact), Err(RuntimeError::Corrupt(_))));

        std::fs::write(&artifact, &pristine[..pristine.len() - 3]).unwrap();
        assert!(matches!(runtime.load(&artifact), Err(RuntimeError::Corrupt(_))));

        let mut future = pristine.clone();
        future[4..6].copy_from_slice(&(ARTIFACT_VERSION + 1).to_le_bytes());
        std::fs::write(&artifact, &future).unwrap();
        assert!(matches!(runtime.load(&artifact), Err(RuntimeError::Incompatible(_))));

        std::fs::write(&artifact, b"not an artifact at all").unwrap();
        assert!(matches!(runtime.load(&artifact), Err(RuntimeError::Corrupt(_))));
    }
}
