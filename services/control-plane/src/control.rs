//! Manifest distribution and command fan-out.
//!
//! # Invariants
//!
//! - Every per-node operation runs under its own deadline and fails alone;
//!   a slow or dead node never delays or fails the others.
//! - Frames to one node are written in order (one writer mutex per link).
//! - Dispatch can be repeated at will. A node whose link is missing or
//!   broken is reconnected and sent its manifest again before the command,
//!   all within the same deadline.
//! - Work on one node is serialized by that node's lock, so concurrent
//!   fan-outs never open two connections to the same agent.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use camfleet_manifest::{ManifestSet, NodeManifest, ServerEntry, ServerRegistry};
use camfleet_proto::{Command, ControlMessage};
use futures_util::future::join_all;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::config::LinkSettings;
use crate::error::ConnectionError;
use crate::link::{LinkMap, NodeLink};

/// Per-node outcome of an initialization or a dispatch.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: Vec<String>,
    pub failed: Vec<(String, ConnectionError)>,
}

impl DispatchReport {
    fn collect(results: Vec<(String, Result<(), ConnectionError>)>) -> Self {
        let mut report = Self::default();
        for (node, result) in results {
            match result {
                Ok(()) => report.delivered.push(node),
                Err(e) => report.failed.push((node, e)),
            }
        }
        report.delivered.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Returns true if every targeted node was reached.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn error_for(&self, node: &str) -> Option<&ConnectionError> {
        self.failed
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, e)| e)
    }
}

/// The cluster controller: one link per registered node.
pub struct ControlPlane {
    registry: ServerRegistry,
    manifests: ManifestSet,
    settings: LinkSettings,
    links: LinkMap,
    node_locks: HashMap<String, Mutex<()>>,
}

impl ControlPlane {
    pub fn new(registry: ServerRegistry, manifests: ManifestSet, settings: LinkSettings) -> Self {
        let node_locks = registry
            .names()
            .map(|node| (node.to_string(), Mutex::new(())))
            .collect();

        Self {
            node_locks,
            registry,
            manifests,
            settings,
            links: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Connect to every node concurrently and deliver its manifest.
    pub async fn initialize(&self) -> DispatchReport {
        info!(nodes = self.registry.len(), "Distributing manifests");

        let tasks = self.registry.iter().map(|(node, entry)| {
            let deadline = self.settings.connect_timeout;
            self.per_node(node, deadline, async move {
                let _serial = self.lock_node(node).await;
                self.connect(node, entry).await.map(|_| ())
            })
        });

        let report = DispatchReport::collect(join_all(tasks).await);
        info!(
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Manifest distribution finished"
        );
        report
    }

    /// Send a command to every node the group filter selects.
    pub async fn dispatch(&self, command: Command) -> DispatchReport {
        let targets: Vec<_> = self.registry.matching(command.group).collect();
        if targets.is_empty() {
            warn!(command = %command, "No nodes match the command's group");
            return DispatchReport::default();
        }

        info!(command = %command, nodes = targets.len(), "Dispatching command");

        let message = ControlMessage::Command(command);
        let tasks = targets.into_iter().map(|(node, entry)| {
            let message = &message;
            let deadline = self.settings.dispatch_timeout;
            self.per_node(node, deadline, async move {
                self.deliver(node, entry, message).await
            })
        });

        let report = DispatchReport::collect(join_all(tasks).await);
        info!(
            command = %command,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "Command dispatch finished"
        );
        report
    }

    /// Nodes with an open link, sorted.
    pub async fn connected_nodes(&self) -> Vec<String> {
        let links = self.links.read().await;
        let mut nodes: Vec<_> = links
            .iter()
            .filter(|(_, link)| link.is_open())
            .map(|(node, _)| node.clone())
            .collect();
        nodes.sort();
        nodes
    }

    pub async fn is_connected(&self, node: &str) -> bool {
        self.live_link(node).await.is_some()
    }

    /// Run one node's share of a fan-out under its own deadline.
    async fn per_node(
        &self,
        node: &str,
        deadline: Duration,
        work: impl Future<Output = Result<(), ConnectionError>>,
    ) -> (String, Result<(), ConnectionError>) {
        let result = match tokio::time::timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(deadline)),
        };

        if let Err(e) = &result {
            warn!(node = %node, error = %e, "Node unreachable");
        }
        (node.to_string(), result)
    }

    async fn deliver(
        &self,
        node: &str,
        entry: &ServerEntry,
        message: &ControlMessage,
    ) -> Result<(), ConnectionError> {
        let _serial = self.lock_node(node).await;

        if let Some(link) = self.live_link(node).await {
            match link.send(message).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(node = %node, error = %e, "Send failed, reconnecting"),
            }
        }

        let link = self.connect(node, entry).await?;
        link.send(message).await
    }

    async fn connect(
        &self,
        node: &str,
        entry: &ServerEntry,
    ) -> Result<Arc<NodeLink>, ConnectionError> {
        let address = entry.address();
        let manifest = self
            .manifests
            .get(node)
            .cloned()
            .unwrap_or_else(|| NodeManifest::new(node, Vec::new()));

        let link = NodeLink::open(node, &address, &manifest, Arc::clone(&self.links)).await?;
        self.links
            .write()
            .await
            .insert(node.to_string(), Arc::clone(&link));

        info!(
            node = %node,
            address = %address,
            entries = manifest.len(),
            "Manifest delivered"
        );
        Ok(link)
    }

    async fn lock_node(&self, node: &str) -> Option<MutexGuard<'_, ()>> {
        match self.node_locks.get(node) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    async fn live_link(&self, node: &str) -> Option<Arc<NodeLink>> {
        self.links
            .read()
            .await
            .get(node)
            .filter(|link| link.is_open())
            .cloned()
    }
}
