pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod runtime;
pub mod storage;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use cache::{CompiledModel, ModelCache};
pub use config::StoreConfig;
pub use error::CacheError;
pub use model::{FeatureMap, FeatureProvider, FeatureValue, FromFeatures, ModelInput, ModelOutput};
pub use runtime::{LinearRuntime, ModelHandle, ModelRuntime, PredictionOptions, RuntimeError};
pub use storage::{ArtifactOrigin, ArtifactStore, DestinationNaming};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "camel",
    version,
    about = "Compile, cache and run models from a persistent artifact store"
)]
pub struct Cli {
    /// Storage root for compiled artifacts (defaults to platform data dir)
    #[arg(long, global = true)]
    pub store_dir: Option<PathBuf>,

    /// How artifact file names are derived: base-name or fingerprint
    #[arg(long, global = true)]
    pub naming: Option<DestinationNaming>,

    /// TOML config file with `root` and `naming`
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compile raw models into the store, reusing artifacts already there
    Compile {
        /// Raw model files, optionally as KEY=PATH (key defaults to the file stem)
        #[arg(required = true)]
        models: Vec<String>,
    },
    /// Run a prediction against a raw model (compiled on first use)
    #[command(group(ArgGroup::new("payload").required(true).args(["input", "batch"])))]
    Predict {
        /// Raw model file
        model: PathBuf,

        /// JSON object of input features, e.g. '{"x": 1.0}'
        #[arg(long)]
        input: Option<String>,

        /// JSON array of input objects, predicted as one batch
        #[arg(long)]
        batch: Option<String>,

        /// Reject input features the model does not declare
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    /// Print the artifact path a raw model maps to
    Path {
        /// Raw model file
        model: PathBuf,
    },
    /// List published artifacts in the store
    List,
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

/// One line of `camel compile` output.
#[derive(Debug, Serialize)]
struct CompileReport<'a> {
    key: &'a str,
    source: &'a Path,
    destination: &'a Path,
    origin: ArtifactOrigin,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    run_with(cli, &mut out)
}

/// Execute a parsed command, writing results to `out`.
pub fn run_with(cli: Cli, out: &mut dyn Write) -> Result<()> {
    match &cli.command {
        Commands::Compile { models } => {
            let specs = models
                .iter()
                .map(|spec| parse_model_spec(spec))
                .collect::<Result<Vec<_>>>()?;
            let store = open_store(&cli)?;
            let cache = ModelCache::new(store);
            let mut built = Vec::with_capacity(specs.len());
            for (key, raw) in &specs {
                let model = cache
                    .add(key.clone(), raw)
                    .with_context(|| format!("compiling model {key} from {}", raw.display()))?;
                built.push((key, model));
            }
            for (key, model) in &built {
                let report = CompileReport {
                    key: key.as_str(),
                    source: model.source(),
                    destination: model.destination(),
                    origin: model.origin(),
                };
                writeln!(out, "{}", serde_json::to_string(&report)?)?;
            }
            Ok(())
        }
        Commands::Predict {
            model,
            input,
            batch,
            strict,
        } => {
            let store = open_store(&cli)?;
            let cache = ModelCache::new(store);
            cache
                .add("model", model)
                .with_context(|| format!("preparing model {}", model.display()))?;
            let options = PredictionOptions {
                reject_unknown_features: *strict,
            };

            if let Some(raw) = input {
                let values: HashMap<String, FeatureValue> =
                    serde_json::from_str(raw).context("parsing --input as a JSON object")?;
                let output: ModelOutput = cache.predict_features(&"model", values, &options)?;
                writeln!(out, "{}", serde_json::to_string(&output)?)?;
            } else if let Some(raw) = batch {
                let inputs: Vec<ModelInput> =
                    serde_json::from_str(raw).context("parsing --batch as a JSON array")?;
                let outputs: Vec<ModelOutput> = cache.predict_batch(&"model", &inputs, &options)?;
                writeln!(out, "{}", serde_json::to_string(&outputs)?)?;
            }
            Ok(())
        }
        Commands::Path { model } => {
            let store = open_store(&cli)?;
            let destination = store.destination_for(model)?;
            writeln!(out, "{}", destination.display())?;
            Ok(())
        }
        Commands::List => {
            let store = open_store(&cli)?;
            for artifact in store.artifacts()? {
                writeln!(out, "{}", artifact.display())?;
            }
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(*shell, &mut cmd, "camel", out);
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            man.render(out)?;
            Ok(())
        }
    }
}

/// `KEY=PATH` or bare `PATH` (key = file stem).
fn parse_model_spec(spec: &str) -> Result<(String, PathBuf)> {
    if let Some((key, path)) = spec.split_once('=')
        && !key.is_empty()
    {
        if path.is_empty() {
            bail!("model spec '{spec}' has an empty path");
        }
        return Ok((key.to_string(), PathBuf::from(path)));
    }

    let path = PathBuf::from(spec);
    let key = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .with_context(|| format!("model spec '{spec}' has no file name to use as key"))?;
    Ok((key, path))
}

fn store_config(cli: &Cli) -> Result<StoreConfig> {
    let mut cfg = match &cli.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::from_env()?,
    };
    if let Some(dir) = &cli.store_dir {
        cfg = cfg.with_root(dir);
    }
    if let Some(naming) = cli.naming {
        cfg = cfg.with_naming(naming);
    }
    Ok(cfg)
}

fn open_store(cli: &Cli) -> Result<ArtifactStore> {
    let cfg = store_config(cli)?;
    tracing::debug!(root = ?cfg.root, naming = %cfg.naming, "opening artifact store");
    Ok(ArtifactStore::from_config(&cfg, Arc::new(LinearRuntime::new())))
}

/// Install the stderr tracing subscriber. `CAMEL_LOG` wins over `RUST_LOG`;
/// default level is `warn`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("CAMEL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "camel", "camel")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("camel"))
}
