use camel::runtime::linear::{Activation, LabelSpec, ModelDescription, OutputSpec};
use camel::{ArtifactStore, LinearRuntime, ModelHandle, ModelRuntime, RuntimeError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Linear runtime that counts compile and load calls.
#[allow(dead_code)]
pub struct CountingRuntime {
    inner: LinearRuntime,
    compiles: AtomicUsize,
    loads: AtomicUsize,
    fail_loads_from: AtomicUsize,
}

#[allow(dead_code)]
impl CountingRuntime {
    pub fn new(scratch: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: LinearRuntime::with_scratch_dir(scratch),
            compiles: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            fail_loads_from: AtomicUsize::new(usize::MAX),
        })
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Make load number `n` (zero-based) and every later load fail.
    pub fn fail_loads_from(&self, n: usize) {
        self.fail_loads_from.store(n, Ordering::SeqCst);
    }
}

impl ModelRuntime for CountingRuntime {
    fn name(&self) -> &str {
        "counting-linear"
    }

    fn compile(&self, raw: &Path) -> Result<PathBuf, RuntimeError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        self.inner.compile(raw)
    }

    fn load(&self, artifact: &Path) -> Result<Box<dyn ModelHandle>, RuntimeError> {
        let n = self.loads.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_loads_from.load(Ordering::SeqCst) {
            return Err(RuntimeError::Incompatible(format!(
                "load #{n} refused by test runtime"
            )));
        }
        self.inner.load(artifact)
    }
}

/// A store under `root/store` whose runtime writes scratch files under
/// `root/scratch`.
#[allow(dead_code)]
pub fn counting_store(root: &Path) -> (ArtifactStore, Arc<CountingRuntime>) {
    let runtime = CountingRuntime::new(&root.join("scratch"));
    let store = ArtifactStore::new(root.join("store"), runtime.clone());
    (store, runtime)
}

/// `y = weight * x + bias` with a `classLabel` that flips at zero.
#[allow(dead_code)]
pub fn affine_model(name: &str, weight: f64, bias: f64) -> ModelDescription {
    ModelDescription {
        name: name.to_string(),
        inputs: vec!["x".to_string()],
        outputs: vec![OutputSpec {
            name: "y".to_string(),
            weights: BTreeMap::from([("x".to_string(), weight)]),
            bias,
            activation: Activation::Identity,
        }],
        label: Some(LabelSpec {
            name: "classLabel".to_string(),
            output: "y".to_string(),
            threshold: 0.0,
            below: "negative".to_string(),
            above: "positive".to_string(),
        }),
    }
}

/// Write `description` as JSON to `dir/file_name`.
#[allow(dead_code)]
pub fn write_raw_model(dir: &Path, file_name: &str, description: &ModelDescription) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    let path = dir.join(file_name);
    std::fs::write(&path, serde_json::to_string_pretty(description).unwrap()).unwrap();
    path
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}
