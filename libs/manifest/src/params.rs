//! Resolved run parameters and the server registry.
//!
//! Both are built once at startup and are read-only afterwards.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::types::Group;

/// Run-level parameters, keyed by upper-case name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParameters {
    values: BTreeMap<String, String>,
}

impl RunParameters {
    /// Build from name/value pairs. Names are normalized to upper case.
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.as_ref().to_ascii_uppercase(), v.into()))
                .collect(),
        }
    }

    /// Look up a parameter. The name is matched case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_uppercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Where a node's agent listens and which group it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,

    /// Nodes without a group only receive unfiltered commands.
    pub group: Option<Group>,
}

impl ServerEntry {
    /// Parse a `host:port` registry value.
    pub fn parse(node: &str, value: &str, group: Option<Group>) -> Result<Self, ConfigError> {
        let invalid = |detail: &str| ConfigError::InvalidServer {
            node: node.to_string(),
            detail: format!("{detail} in '{value}'"),
        };

        let (host, port) = value
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            group,
        })
    }

    /// Connectable `host:port` string.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if a command with this group filter targets the node.
    pub fn matches(&self, filter: Option<Group>) -> bool {
        match filter {
            None => true,
            Some(group) => self.group == Some(group),
        }
    }
}

/// Node name to server entry. Node names are lower-case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerEntry>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: impl AsRef<str>, entry: ServerEntry) {
        self.servers
            .insert(node.as_ref().to_ascii_lowercase(), entry);
    }

    pub fn get(&self, node: &str) -> Option<&ServerEntry> {
        self.servers.get(&node.to_ascii_lowercase())
    }

    pub fn contains(&self, node: &str) -> bool {
        self.get(node).is_some()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServerEntry)> {
        self.servers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// Nodes targeted by a command with the given group filter.
    pub fn matching(&self, filter: Option<Group>) -> impl Iterator<Item = (&str, &ServerEntry)> {
        self.iter().filter(move |(_, entry)| entry.matches(filter))
    }
}

impl<S: AsRef<str>> FromIterator<(S, ServerEntry)> for ServerRegistry {
    fn from_iter<T: IntoIterator<Item = (S, ServerEntry)>>(iter: T) -> Self {
        let mut registry = ServerRegistry::new();
        for (node, entry) in iter {
            registry.insert(node, entry);
        }
        registry
    }
}
