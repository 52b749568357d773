//! Manifest generation.
//!
//! Expands raw per-node templates into concrete manifests by substituting
//! `$NAME` tokens against the run parameters.
//!
//! # Invariants
//!
//! - Substitution is total: a generated manifest never contains a
//!   `$`-prefixed token in `args`, `kwargs` values or `flags`.
//! - Generation is all-or-nothing: any error aborts before a single manifest
//!   is returned, so no partial cluster state can be distributed.
//! - Manifests are strictly per node.

use std::collections::BTreeMap;

use crate::error::ConfigError;
use crate::params::{RunParameters, ServerRegistry};
use crate::types::{NodeManifest, ProcessManifestEntry, ProcessTemplate, MAX_TIMEOUT_SECS};

/// Raw templates keyed by target node name.
pub type TemplateSet = BTreeMap<String, Vec<ProcessTemplate>>;

/// Generated manifests keyed by node name.
pub type ManifestSet = BTreeMap<String, NodeManifest>;

/// Expands templates against a fixed set of run parameters.
pub struct ManifestGenerator<'a> {
    params: &'a RunParameters,
}

impl<'a> ManifestGenerator<'a> {
    pub fn new(params: &'a RunParameters) -> Self {
        Self { params }
    }

    /// Generate one manifest per registered node.
    ///
    /// Registered nodes without templates get an empty manifest. Templates
    /// for unregistered nodes are an error.
    pub fn generate(
        &self,
        templates: &TemplateSet,
        registry: &ServerRegistry,
    ) -> Result<ManifestSet, ConfigError> {
        if let Some(unknown) = templates.keys().find(|node| !registry.contains(node)) {
            return Err(ConfigError::UnknownNode(unknown.clone()));
        }

        let mut manifests = ManifestSet::new();
        for node in registry.names() {
            let node_templates = templates
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(node))
                .map(|(_, entries)| entries.as_slice())
                .unwrap_or_default();

            let manifest = self.generate_node(node, node_templates)?;
            manifests.insert(node.to_string(), manifest);
        }

        Ok(manifests)
    }

    /// Generate the manifest for a single node.
    pub fn generate_node(
        &self,
        node: &str,
        templates: &[ProcessTemplate],
    ) -> Result<NodeManifest, ConfigError> {
        let entries = templates
            .iter()
            .enumerate()
            .map(|(index, template)| self.expand(node, index, template))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(NodeManifest::new(node, entries))
    }

    fn expand(
        &self,
        node: &str,
        index: usize,
        template: &ProcessTemplate,
    ) -> Result<ProcessManifestEntry, ConfigError> {
        validate(node, index, template)?;

        let args = template
            .args
            .iter()
            .map(|v| self.resolve(node, v))
            .collect::<Result<_, _>>()?;

        let kwargs = template
            .kwargs
            .iter()
            .map(|(k, v)| Ok((k.clone(), self.resolve(node, v)?)))
            .collect::<Result<_, ConfigError>>()?;

        let flags = template
            .flags
            .iter()
            .map(|v| self.resolve(node, v))
            .collect::<Result<_, _>>()?;

        Ok(ProcessManifestEntry {
            mode: template.mode,
            command: template.command.clone(),
            timeout_secs: template.timeout_secs,
            args,
            kwargs,
            flags,
            group: template.group,
            description: template.description.clone(),
        })
    }

    /// Resolve one field value. Values without a leading `$` pass through.
    fn resolve(&self, node: &str, value: &str) -> Result<String, ConfigError> {
        let Some(name) = value.strip_prefix('$') else {
            return Ok(value.to_string());
        };

        let key = name.to_ascii_uppercase();
        let resolved = self
            .params
            .get(&key)
            .ok_or_else(|| ConfigError::MissingParameter {
                node: node.to_string(),
                key: key.clone(),
            })?;

        if resolved.starts_with('$') {
            return Err(ConfigError::UnresolvedToken {
                key,
                value: resolved.to_string(),
            });
        }

        Ok(resolved.to_string())
    }
}

fn validate(node: &str, index: usize, template: &ProcessTemplate) -> Result<(), ConfigError> {
    let malformed = |detail: &str| ConfigError::MalformedTemplate {
        origin: format!("node '{node}' entry {index}"),
        detail: detail.to_string(),
    };

    if template.command.trim().is_empty() {
        return Err(malformed("command is empty"));
    }

    if !template.timeout_secs.is_finite() || template.timeout_secs < 0.0 {
        return Err(malformed("timeout must be a non-negative number of seconds"));
    }

    if template.timeout_secs > MAX_TIMEOUT_SECS {
        let detail = format!("timeout must not exceed {MAX_TIMEOUT_SECS} seconds");
        return Err(malformed(&detail));
    }

    Ok(())
}
