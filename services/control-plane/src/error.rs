//! Control plane errors.

use std::io;
use std::time::Duration;

use camfleet_manifest::UnknownGroup;
use camfleet_proto::ProtocolError;
use thiserror::Error;

/// Failure to reach or talk to one node agent.
///
/// These are always scoped to a single node; the other nodes of a fan-out
/// are unaffected.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("cannot reach {address}: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("no answer within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The connection broke while writing.
    #[error("connection dropped: {0}")]
    Dropped(String),

    #[error("rejected by agent: {0}")]
    Rejected(String),

    #[error(transparent)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => ConnectionError::Dropped(e.to_string()),
            other => ConnectionError::Protocol(other),
        }
    }
}

/// Prompt input that is not a command.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("empty input")]
    Empty,

    #[error("unknown command '{0}' (type 'help' for the list)")]
    UnknownCommand(String),

    #[error(transparent)]
    UnknownGroup(#[from] UnknownGroup),
}
