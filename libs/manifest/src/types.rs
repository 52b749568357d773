//! Manifest data model shared by the control plane and the node agent.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

// =============================================================================
// Groups
// =============================================================================

/// Coarse node category used to scope commands to a subset of the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Ingest,
    Tracking,
    Postprocessing,
    Archive,
}

impl Group {
    /// Every group, in display order.
    pub const ALL: [Group; 4] = [
        Group::Ingest,
        Group::Tracking,
        Group::Postprocessing,
        Group::Archive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Group::Ingest => "ingest",
            Group::Tracking => "tracking",
            Group::Postprocessing => "postprocessing",
            Group::Archive => "archive",
        }
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A group name that is not one of the known groups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown group '{0}' (expected ingest, tracking, postprocessing or archive)")]
pub struct UnknownGroup(pub String);

impl FromStr for Group {
    type Err = UnknownGroup;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Group::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownGroup(name.to_string()))
    }
}

// =============================================================================
// Manifest Entries
// =============================================================================

/// How an entry is launched on the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessMode {
    /// A function registered inside the agent, looked up by `command`.
    #[serde(rename = "process", alias = "in_process_function")]
    InProcessFunction,

    /// An external program spawned as a child process.
    #[serde(rename = "subprocess", alias = "external_subprocess")]
    ExternalSubprocess,
}

impl ProcessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessMode::InProcessFunction => "process",
            ProcessMode::ExternalSubprocess => "subprocess",
        }
    }
}

/// One process a node is responsible for running.
///
/// Raw templates read from disk use the same shape; after generation every
/// `$NAME` token in `args`, `kwargs` values and `flags` has been replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessManifestEntry {
    pub mode: ProcessMode,

    /// Program path or registered function name.
    pub command: String,

    /// Grace period for cooperative stops, in seconds.
    #[serde(rename = "timeout")]
    pub timeout_secs: f64,

    #[serde(default, deserialize_with = "scalar_seq")]
    pub args: Vec<String>,

    #[serde(default, deserialize_with = "scalar_map")]
    pub kwargs: BTreeMap<String, String>,

    #[serde(default, deserialize_with = "scalar_set")]
    pub flags: BTreeSet<String>,

    pub group: Group,

    #[serde(default)]
    pub description: String,
}

/// Raw per-node template as read from the template directory.
pub type ProcessTemplate = ProcessManifestEntry;

/// Longest stop grace period an entry may ask for, in seconds (one week).
pub const MAX_TIMEOUT_SECS: f64 = 604_800.0;

impl ProcessManifestEntry {
    /// Stop grace period. Malformed values collapse to zero and oversized
    /// ones are capped at [`MAX_TIMEOUT_SECS`].
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .map(|timeout| timeout.min(Duration::from_secs_f64(MAX_TIMEOUT_SECS)))
            .unwrap_or(Duration::ZERO)
    }

    /// Fields that still hold a `$`-prefixed token.
    pub fn unresolved_tokens(&self) -> Vec<&str> {
        self.args
            .iter()
            .chain(self.kwargs.values())
            .chain(self.flags.iter())
            .map(String::as_str)
            .filter(|v| v.starts_with('$'))
            .collect()
    }
}

/// The ordered list of entries one node runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeManifest {
    pub node: String,
    pub entries: Vec<ProcessManifestEntry>,
}

impl NodeManifest {
    pub fn new(node: impl Into<String>, entries: Vec<ProcessManifestEntry>) -> Self {
        Self {
            node: node.into(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Runtime Status
// =============================================================================

/// Runtime status of a manifest entry on its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Pending,
    Starting,
    Running,
    Failed,
    Restarting,
    Stopping,
    Terminated,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Pending => "pending",
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Restarting => "restarting",
            ProcessStatus::Stopping => "stopping",
            ProcessStatus::Terminated => "terminated",
        }
    }

    /// Returns true while the supervisor is actively driving the entry.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting
                | ProcessStatus::Running
                | ProcessStatus::Restarting
                | ProcessStatus::Stopping
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Scalar Deserialization
// =============================================================================

/// Templates are hand-written JSON, so numbers and booleans show up where
/// strings are expected.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn scalar_seq<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let items = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(items.into_iter().map(Scalar::into_string).collect())
}

fn scalar_set<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeSet<String>, D::Error> {
    let items = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(items.into_iter().map(Scalar::into_string).collect())
}

fn scalar_map<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error> {
    let items = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
    Ok(items
        .into_iter()
        .map(|(k, v)| (k, v.into_string()))
        .collect())
}
