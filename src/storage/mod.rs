//! Persistent storage for compiled artifacts.

pub mod artifact_store;

pub use artifact_store::{
    ArtifactOrigin, ArtifactStore, DestinationNaming, ObtainedArtifact, STAGING_PREFIX,
};
