//! Configuration errors.
//!
//! Every variant is fatal for a control-plane run and is raised before any
//! manifest leaves the controller.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::UnknownGroup;

/// Errors raised while loading configuration or generating manifests.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A template references a parameter that the run config does not define.
    #[error("missing run parameter '{key}' referenced by a template for node '{node}'")]
    MissingParameter { node: String, key: String },

    /// A parameter value is itself a `$` token, so substitution cannot be total.
    #[error("run parameter '{key}' resolves to '{value}', which is itself a token")]
    UnresolvedToken { key: String, value: String },

    /// A template could not be parsed or fails validation.
    #[error("malformed template in {origin}: {detail}")]
    MalformedTemplate { origin: String, detail: String },

    /// Templates target a node the server registry does not know.
    #[error("templates target node '{0}', which is not in the server registry")]
    UnknownNode(String),

    /// A `[SERVERS]` value is not `host:port`.
    #[error("invalid server address for '{node}': {detail}")]
    InvalidServer { node: String, detail: String },

    /// A `[GROUPS]` value is not a known group.
    #[error("invalid group for '{node}': {source}")]
    InvalidGroup {
        node: String,
        #[source]
        source: UnknownGroup,
    },

    /// A required run-config section is absent.
    #[error("missing section [{0}] in run config")]
    MissingSection(&'static str),

    /// The run config could not be read or parsed.
    #[error("failed to load run config: {0}")]
    Load(#[from] config::ConfigError),

    /// IO error reading templates.
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    /// Returns true if this error names a missing substitution parameter.
    pub fn is_missing_parameter(&self) -> bool {
        matches!(self, ConfigError::MissingParameter { .. })
    }
}
