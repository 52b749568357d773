//! Process manifests for the camfleet cluster.
//!
//! This crate holds the data model shared by the control plane and the node
//! agents, plus the pieces that turn configuration into manifests:
//!
//! - [`RunParameters`] and [`ServerRegistry`]: the read-only parameter store
//! - [`ManifestGenerator`]: `$NAME` substitution into per-node manifests
//! - [`RunConfig`] and [`load_templates`]: reading the INI run config and the
//!   template directory

pub mod error;
pub mod generator;
pub mod loader;
pub mod params;
pub mod types;

pub use error::ConfigError;
pub use generator::{ManifestGenerator, ManifestSet, TemplateSet};
pub use loader::{load_templates, RunConfig};
pub use params::{RunParameters, ServerEntry, ServerRegistry};
pub use types::{
    Group, NodeManifest, ProcessManifestEntry, ProcessMode, ProcessStatus, ProcessTemplate,
    UnknownGroup, MAX_TIMEOUT_SECS,
};
