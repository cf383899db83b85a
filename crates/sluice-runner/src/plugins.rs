//! Plugin resolution for local tasks.
//!
//! A plugin is a directory holding a `plugin.yml` manifest plus whatever
//! files its script needs. Resolving one checks the task inputs against the
//! manifest and copies the directory to a private temp dir that is mounted
//! into the task container.

use serde::{Deserialize, Serialize};
use sluice_core::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

pub const MANIFEST_FILE: &str = "plugin.yml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    pub script: String,
    #[serde(default)]
    pub docker: Option<PluginDocker>,
    #[serde(default)]
    pub inputs: Vec<PluginInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDocker {
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInput {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl PluginManifest {
    /// Fill in defaults and reject missing required inputs.
    pub fn apply_inputs(&self, inputs: &mut BTreeMap<String, String>) -> Result<()> {
        let mut missing = Vec::new();
        for input in &self.inputs {
            if inputs.contains_key(&input.name) {
                continue;
            }
            match &input.default {
                Some(default) => {
                    inputs.insert(input.name.clone(), default.clone());
                }
                None if input.required => missing.push(input.name.as_str()),
                None => {}
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "plugin '{}' is missing required inputs: {}",
                self.name,
                missing.join(", ")
            )))
        }
    }
}

/// A plugin ready to mount. The copy is deleted when this is dropped.
#[derive(Debug)]
pub struct ResolvedPlugin {
    pub manifest: PluginManifest,
    dir: TempDir,
}

impl ResolvedPlugin {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

pub trait PluginResolver: Send + Sync {
    /// Look up `name`, validate `inputs` against it and stage a private copy.
    fn resolve(&self, name: &str, inputs: &mut BTreeMap<String, String>) -> Result<ResolvedPlugin>;
}

/// Plugins stored as `<root>/<name>/plugin.yml`.
#[derive(Debug, Clone)]
pub struct DirPluginResolver {
    root: PathBuf,
}

impl DirPluginResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self, name: &str) -> Result<PluginManifest> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::PluginNotFound(name.to_string()));
        }
        let path = self.root.join(name).join(MANIFEST_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::PluginNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Serialization(format!("{}: {e}", path.display())))
    }
}

impl PluginResolver for DirPluginResolver {
    fn resolve(&self, name: &str, inputs: &mut BTreeMap<String, String>) -> Result<ResolvedPlugin> {
        let manifest = self.manifest(name)?;
        manifest.apply_inputs(inputs)?;

        let dir = tempfile::Builder::new().prefix("sluice-plugin-").tempdir()?;
        copy_dir(&self.root.join(name), dir.path())?;
        debug!(plugin = %name, dir = %dir.path().display(), "Plugin staged");

        Ok(ResolvedPlugin { manifest, dir })
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
