//! Wire protocol between the control plane and the node agents.
//!
//! One TCP connection per agent carries length-prefixed, versioned JSON
//! frames in both directions. See [`codec`] for the framing and [`message`]
//! for what travels inside a frame.

pub mod codec;
pub mod command;
pub mod error;
pub mod message;

pub use codec::{decode, encode, write_frame, FrameDecoder, FrameReader, MAX_FRAME_LEN};
pub use command::{Command, CommandKind};
pub use error::ProtocolError;
pub use message::{
    AgentMessage, ControlMessage, Envelope, ProcessId, StatusEvent, StatusReport,
    PROTOCOL_VERSION,
};
