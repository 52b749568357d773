//! Node agent errors.

use thiserror::Error;

/// A manifest entry could not be launched.
///
/// The entry goes to `Failed`; the rest of the manifest is unaffected.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The program could not be spawned.
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// No in-process function is registered under this name.
    #[error("no in-process function registered as '{0}'")]
    UnknownFunction(String),

    /// The spawned child reported no pid.
    #[error("'{0}' exited before its pid could be read")]
    NoPid(String),
}

/// Errors returned by the supervisor handle.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A different manifest is already driving live processes.
    #[error("manifest refused: {active} entries of the current manifest are still active")]
    ManifestRefused { active: usize },

    /// The supervisor task is gone.
    #[error("supervisor stopped")]
    Stopped,
}
