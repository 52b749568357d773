//! Message types carried on a control connection.
//!
//! ```text
//! control plane                          node agent
//!      |  manifest (exactly once, first)  ->  |
//!      |  command  (any number)           ->  |
//!      |  <-  status   (any number)           |
//!      |  <-  rejected (then close)           |
//! ```

use std::fmt;

use camfleet_manifest::{NodeManifest, ProcessStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::Command;

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u16 = 1;

/// Versioned wrapper around every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub version: u16,
    pub message: T,
}

impl<T> Envelope<T> {
    pub fn new(message: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message,
        }
    }
}

/// Control plane to agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Manifest(NodeManifest),
    Command(Command),
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Manifest(_) => "manifest",
            ControlMessage::Command(_) => "command",
        }
    }
}

/// Agent to control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Status(StatusReport),

    /// Sent on a connection the agent refuses, right before it closes.
    Rejected { reason: String },
}

/// Identifier of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProcessId {
    /// OS process id of an external subprocess.
    Os(u32),

    /// Task id of an in-process function.
    Task(Uuid),
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessId::Os(pid) => write!(f, "pid:{pid}"),
            ProcessId::Task(id) => write!(f, "task:{id}"),
        }
    }
}

/// What a status report is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEvent {
    /// Plain state transition.
    Transition,
    LaunchFailed,
    /// A running entry exited unexpectedly.
    Crashed,
    RestartScheduled,
    /// The entry crashed past its retry bound and stays failed.
    RetriesExhausted,
    /// A soft stop ran out of time and the entry was killed.
    Escalated,
}

impl StatusEvent {
    /// Returns true for events that report a problem.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            StatusEvent::LaunchFailed | StatusEvent::Crashed | StatusEvent::RetriesExhausted
        )
    }
}

/// A status change of one manifest entry on one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node: String,

    /// Index of the entry in the node's manifest.
    pub entry: usize,

    pub command: String,
    pub status: ProcessStatus,
    pub event: StatusEvent,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<ProcessId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    pub at: DateTime<Utc>,
}
