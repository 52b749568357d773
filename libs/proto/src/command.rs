//! Lifecycle commands issued by the control plane.

use std::fmt;

use camfleet_manifest::Group;
use serde::{Deserialize, Serialize};

/// Lifecycle command vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Start,
    FinishProcessing,
    SoftStop,
    HardStop,
}

impl CommandKind {
    /// Every command, in help order.
    pub const ALL: [CommandKind; 4] = [
        CommandKind::Start,
        CommandKind::FinishProcessing,
        CommandKind::SoftStop,
        CommandKind::HardStop,
    ];

    /// Keyword as typed at the prompt.
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Start => "START",
            CommandKind::FinishProcessing => "FINISH PROCESSING",
            CommandKind::SoftStop => "SOFT STOP",
            CommandKind::HardStop => "HARD STOP",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CommandKind::Start => "start/restart all processes as needed based on the run config",
            CommandKind::FinishProcessing => "less urgent graceful shutdown",
            CommandKind::SoftStop => "component-implemented graceful shutdown",
            CommandKind::HardStop => "immediate forced process termination",
        }
    }

    /// Match a keyword case-insensitively. Runs of whitespace and underscores
    /// count as a single space, so `soft_stop` and `Soft  Stop` both match.
    pub fn from_keyword(input: &str) -> Option<Self> {
        let normalized = input
            .split(|c: char| c.is_whitespace() || c == '_')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        CommandKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(&normalized))
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command, optionally restricted to one node group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
}

impl Command {
    /// A command for every node.
    pub fn new(kind: CommandKind) -> Self {
        Self { kind, group: None }
    }

    /// A command for the nodes of one group.
    pub fn for_group(kind: CommandKind, group: Group) -> Self {
        Self {
            kind,
            group: Some(group),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group {
            Some(group) => write!(f, "{},{}", self.kind, group),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("START", CommandKind::Start)]
    #[case("start", CommandKind::Start)]
    #[case("Finish Processing", CommandKind::FinishProcessing)]
    #[case("soft_stop", CommandKind::SoftStop)]
    #[case("  HARD   STOP ", CommandKind::HardStop)]
    fn test_keyword_matching(#[case] input: &str, #[case] expected: CommandKind) {
        assert_eq!(CommandKind::from_keyword(input), Some(expected));
    }

    #[rstest]
    #[case("")]
    #[case("STOP")]
    #[case("SOFTSTOP")]
    #[case("START NOW")]
    fn test_keyword_rejects(#[case] input: &str) {
        assert_eq!(CommandKind::from_keyword(input), None);
    }

    #[test]
    fn test_command_display() {
        assert_eq!(Command::new(CommandKind::SoftStop).to_string(), "SOFT STOP");
        assert_eq!(
            Command::for_group(CommandKind::Start, Group::Tracking).to_string(),
            "START,tracking"
        );
    }

    #[test]
    fn test_command_serialization() {
        let json = serde_json::to_string(&Command::new(CommandKind::FinishProcessing)).unwrap();
        assert_eq!(json, r#"{"kind":"FINISH_PROCESSING"}"#);

        let cmd: Command =
            serde_json::from_str(r#"{"kind":"HARD_STOP","group":"archive"}"#).unwrap();
        assert_eq!(cmd, Command::for_group(CommandKind::HardStop, Group::Archive));
    }
}
