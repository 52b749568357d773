//! Protocol errors.

use thiserror::Error;

/// Errors raised while framing, encoding or decoding control messages.
///
/// Any of these on a live connection closes that connection only.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Declared frame length exceeds the limit.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The peer closed the stream in the middle of a frame.
    #[error("connection closed mid-frame with {buffered} bytes buffered")]
    Truncated { buffered: usize },

    /// The envelope carries a version this build cannot read.
    #[error("unsupported protocol version {got} (supported 1..={supported})")]
    UnsupportedVersion { got: u16, supported: u16 },

    /// The payload is not a valid envelope or message.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A well-formed message arrived where the protocol does not allow it.
    #[error("unexpected message: {0}")]
    Unexpected(String),

    /// IO error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
