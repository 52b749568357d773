//! Run-config and template-directory loading.
//!
//! The run config is an INI file:
//!
//! ```text
//! [PARAMETERS]
//! camera_count = 4
//!
//! [SERVERS]
//! node1 = 10.2.219.150:5999
//!
//! [GROUPS]
//! node1 = ingest
//! ```
//!
//! Section names are matched case-insensitively, parameter names are
//! normalized to upper case and node names to lower case. `[GROUPS]` is
//! optional.
//!
//! Templates live in a directory of `*.json` files, each holding a JSON array
//! of process templates. The target node is the file name up to the first
//! `:` or, failing that, the file stem.

use std::fs;
use std::path::Path;

use config::{Config, File, FileFormat, Map, Source, Value};

use crate::error::ConfigError;
use crate::generator::TemplateSet;
use crate::params::{RunParameters, ServerEntry, ServerRegistry};
use crate::types::{Group, ProcessTemplate};

const PARAMETERS: &str = "PARAMETERS";
const SERVERS: &str = "SERVERS";
const GROUPS: &str = "GROUPS";

/// Parsed run configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub parameters: RunParameters,
    pub servers: ServerRegistry,
}

impl RunConfig {
    /// Load the run config from an INI file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .build()?;
        Self::from_sections(settings.collect()?)
    }

    /// Parse the run config from INI text.
    pub fn from_ini_str(text: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::from_str(text, FileFormat::Ini))
            .build()?;
        Self::from_sections(settings.collect()?)
    }

    fn from_sections(mut root: Map<String, Value>) -> Result<Self, ConfigError> {
        let parameters = take_section(&mut root, PARAMETERS)?
            .ok_or(ConfigError::MissingSection(PARAMETERS))?;
        let servers = take_section(&mut root, SERVERS)?
            .ok_or(ConfigError::MissingSection(SERVERS))?;
        let groups = take_section(&mut root, GROUPS)?.unwrap_or_default();

        let parameters = RunParameters::new(parameters);

        let mut registry = ServerRegistry::new();
        for (node, address) in servers {
            let group = groups
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&node))
                .map(|(_, group)| {
                    group.parse::<Group>().map_err(|source| ConfigError::InvalidGroup {
                        node: node.clone(),
                        source,
                    })
                })
                .transpose()?;

            registry.insert(&node, ServerEntry::parse(&node, &address, group)?);
        }

        if let Some(stray) = groups.iter().find(|(name, _)| !registry.contains(name)) {
            return Err(ConfigError::UnknownNode(stray.0.clone()));
        }

        Ok(Self {
            parameters,
            servers: registry,
        })
    }
}

/// Remove a section from the parsed INI tree and flatten it to strings.
fn take_section(
    root: &mut Map<String, Value>,
    name: &'static str,
) -> Result<Option<Vec<(String, String)>>, ConfigError> {
    let Some(key) = root.keys().find(|k| k.eq_ignore_ascii_case(name)).cloned() else {
        return Ok(None);
    };

    let Some(value) = root.remove(&key) else {
        return Ok(None);
    };

    let mut pairs = value
        .into_table()?
        .into_iter()
        .map(|(k, v)| Ok((k, v.into_string()?)))
        .collect::<Result<Vec<_>, ConfigError>>()?;
    pairs.sort();

    Ok(Some(pairs))
}

/// Load every template file in `dir`, keyed by target node.
pub fn load_templates(dir: &Path) -> Result<TemplateSet, ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut files = fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    files.retain(|p| p.is_file() && is_json(p));
    files.sort();

    let mut templates = TemplateSet::new();
    for path in files {
        let Some(node) = node_name(&path) else {
            continue;
        };

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let entries: Vec<ProcessTemplate> =
            serde_json::from_str(&text).map_err(|e| ConfigError::MalformedTemplate {
                origin: path.display().to_string(),
                detail: e.to_string(),
            })?;

        templates.entry(node).or_default().extend(entries);
    }

    Ok(templates)
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// `node1:gpu0.json` and `node1.json` both target `node1`.
fn node_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    let name = match file_name.split_once(':') {
        Some((node, _)) => node,
        None => path.file_stem()?.to_str()?,
    };

    let name = name.trim();
    (!name.is_empty()).then(|| name.to_ascii_lowercase())
}
