//! Persistent store for compiled model artifacts.
//!
//! Each raw model maps to one destination file under the storage root.
//! [`ArtifactStore::obtain`] runs a two-step protocol:
//!
//! 1. **probe** the destination: if the runtime can load it, reuse it as-is
//!    (no writes).
//! 2. otherwise **compile and publish**: compile the raw model to a fresh
//!    artifact, then [`publish`](ArtifactStore::publish) it over the
//!    destination.
//!
//! Publishing copies the fresh artifact into a staging file in the same
//! directory, fsyncs it and renames it over the destination. Readers in other
//! processes see either the previous complete file or the new complete file.
//! Processes racing on the same destination may both compile; the last rename
//! wins and the result is still one complete artifact.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::error::{CacheError, Result};
use crate::runtime::{ModelHandle, ModelRuntime, RuntimeError};

/// Prefix of in-flight staging files; never a published artifact.
pub const STAGING_PREFIX: &str = ".camel-staging-";

/// Hex digits of the content digest kept in fingerprinted names.
const FINGERPRINT_HEX_LEN: usize = 16;

/// How a destination file name is derived from a raw model location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationNaming {
    /// Reuse the raw file's base name. Two raw models with the same file name
    /// in different directories share one destination.
    #[default]
    BaseName,
    /// `<stem>-<sha256 prefix>.<ext>` over the raw file's content. Distinct
    /// content never shares a destination; editing a raw model yields a new
    /// artifact.
    Fingerprint,
}

impl FromStr for DestinationNaming {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base-name" | "basename" | "base_name" => Ok(Self::BaseName),
            "fingerprint" | "content-hash" => Ok(Self::Fingerprint),
            other => Err(format!(
                "unknown naming '{other}', expected 'base-name' or 'fingerprint'"
            )),
        }
    }
}

impl fmt::Display for DestinationNaming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaseName => write!(f, "base-name"),
            Self::Fingerprint => write!(f, "fingerprint"),
        }
    }
}

/// Whether an artifact was reused from disk or freshly compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactOrigin {
    Reused,
    Compiled,
}

/// Result of [`ArtifactStore::obtain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObtainedArtifact {
    pub destination: PathBuf,
    pub origin: ArtifactOrigin,
}

/// On-disk home of compiled artifacts, bound to one runtime.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    naming: DestinationNaming,
    runtime: Arc<dyn ModelRuntime>,
}

impl fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.root)
            .field("naming", &self.naming)
            .field("runtime", &self.runtime.name())
            .finish()
    }
}

impl ArtifactStore {
    /// Store rooted at `root` with base-name destinations. No I/O happens
    /// until the first publish.
    pub fn new(root: impl Into<PathBuf>, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            root: root.into(),
            naming: DestinationNaming::default(),
            runtime,
        }
    }

    pub fn from_config(config: &StoreConfig, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self::new(config.root.clone(), runtime).with_naming(config.naming)
    }

    pub fn with_naming(mut self, naming: DestinationNaming) -> Self {
        self.naming = naming;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn naming(&self) -> DestinationNaming {
        self.naming
    }

    pub fn runtime(&self) -> &Arc<dyn ModelRuntime> {
        &self.runtime
    }

    /// Deterministic destination for `raw`.
    ///
    /// Fingerprint naming reads the raw file; an unreadable raw model is a
    /// compilation failure, same as a location with no file name.
    pub fn destination_for(&self, raw: &Path) -> Result<PathBuf> {
        let file_name = raw.file_name().ok_or_else(|| {
            CacheError::compilation(
                raw,
                RuntimeError::Malformed("raw model location has no file name".to_string()),
            )
        })?;

        match self.naming {
            DestinationNaming::BaseName => Ok(self.root.join(file_name)),
            DestinationNaming::Fingerprint => {
                let digest = content_fingerprint(raw)
                    .map_err(|err| CacheError::compilation(raw, RuntimeError::Io(err)))?;
                let stem = raw.file_stem().unwrap_or(file_name).to_string_lossy();
                let name = match raw.extension() {
                    Some(ext) => format!("{stem}-{digest}.{}", ext.to_string_lossy()),
                    None => format!("{stem}-{digest}"),
                };
                Ok(self.root.join(name))
            }
        }
    }

    /// Try to load an existing artifact. Missing, corrupt or incompatible
    /// files yield `None`.
    pub fn probe(&self, destination: &Path) -> Option<Box<dyn ModelHandle>> {
        if !destination.is_file() {
            debug!(?destination, "no persisted artifact");
            return None;
        }
        match self.runtime.load(destination) {
            Ok(handle) => Some(handle),
            Err(err) => {
                debug!(?destination, error = %err, "persisted artifact unusable");
                None
            }
        }
    }

    /// Compile `raw` and publish the result at `destination`.
    ///
    /// The fresh artifact is removed whether or not publishing succeeds.
    pub fn compile_and_publish(&self, raw: &Path, destination: &Path) -> Result<()> {
        let started = Instant::now();
        let fresh = self
            .runtime
            .compile(raw)
            .map_err(|err| CacheError::compilation(raw, err))?;

        let published = self.publish(&fresh, destination);
        if published.is_err() {
            let _ = fs::remove_file(&fresh);
        }
        published?;

        info!(
            runtime = self.runtime.name(),
            ?raw,
            ?destination,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "compiled and published artifact"
        );
        Ok(())
    }

    /// Atomically move the artifact at `fresh` to `destination`, replacing
    /// whatever is there.
    pub fn publish(&self, fresh: &Path, destination: &Path) -> Result<()> {
        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(self.root.as_path());
        fs::create_dir_all(parent).map_err(|err| CacheError::storage(parent, err))?;

        let mut staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempfile_in(parent)
            .map_err(|err| CacheError::storage(parent, err))?;
        let mut source = File::open(fresh).map_err(|err| CacheError::storage(fresh, err))?;
        io::copy(&mut source, staging.as_file_mut())
            .map_err(|err| CacheError::storage(destination, err))?;
        staging
            .as_file()
            .sync_all()
            .map_err(|err| CacheError::storage(destination, err))?;

        staging
            .persist(destination)
            .map_err(|err| CacheError::storage(destination, err.error))?;
        sync_dir(parent).map_err(|err| CacheError::storage(parent, err))?;

        if let Err(err) = fs::remove_file(fresh) {
            debug!(?fresh, error = %err, "fresh artifact left behind");
        }
        Ok(())
    }

    /// Return a loadable artifact location for `raw`, compiling at most once.
    pub fn obtain(&self, raw: &Path) -> Result<ObtainedArtifact> {
        let destination = self.destination_for(raw)?;

        if self.probe(&destination).is_some() {
            debug!(?raw, ?destination, "reusing persisted artifact");
            return Ok(ObtainedArtifact {
                destination,
                origin: ArtifactOrigin::Reused,
            });
        }

        self.compile_and_publish(raw, &destination)?;
        Ok(ObtainedArtifact {
            destination,
            origin: ArtifactOrigin::Compiled,
        })
    }

    /// Load the artifact at `destination` into a runtime handle.
    pub fn load(&self, destination: &Path) -> Result<Box<dyn ModelHandle>> {
        self.runtime
            .load(destination)
            .map_err(|source| CacheError::Load {
                path: destination.to_path_buf(),
                source,
            })
    }

    /// Published artifacts under the root, sorted. Staging files are skipped.
    pub fn artifacts(&self) -> Result<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root).map_err(|err| CacheError::storage(&self.root, err))?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| CacheError::storage(&self.root, err))?;
            let path = entry.path();
            let staging = entry
                .file_name()
                .to_string_lossy()
                .starts_with(STAGING_PREFIX);
            if !staging && path.is_file() {
                artifacts.push(path);
            }
        }
        artifacts.sort();
        Ok(artifacts)
    }
}

fn content_fingerprint(raw: &Path) -> io::Result<String> {
    let mut file = File::open(raw)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    let digest = hex::encode(hasher.finalize());
    Ok(digest[..FINGERPRINT_HEX_LEN].to_string())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}
