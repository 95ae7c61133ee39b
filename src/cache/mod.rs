//! Compiled models and the keyed cache that holds them.
//!
//! - **[`compiled`]**: [`CompiledModel`], one loaded model plus its source and
//!   artifact locations.
//! - **[`keyed`]**: [`ModelCache`], key → [`CompiledModel`] with add/set/resolve
//!   and prediction shortcuts.

pub mod compiled;
pub mod keyed;

pub use compiled::CompiledModel;
pub use keyed::ModelCache;
