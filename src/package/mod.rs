//! Package descriptor model.
//!
//! A descriptor is a JSON object declaring a package's name, version, build
//! metadata and dependencies. Dependencies are the same shape and are parsed
//! inline from the parent descriptor, never from their own file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::options::Options;
use crate::runtime::Runtime;

/// Default file name for a package descriptor inside a package directory.
pub const DESCRIPTOR_FILE: &str = "package.json";

/// A declarative package descriptor.
///
/// Immutable once loaded; operations require [`Package::is_loaded`] and fail
/// fast otherwise.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Source location override (url, directory, ...), consumed by plugins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Name of the executable this package installs into the bin namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    /// Extra options forwarded verbatim to the build plugin.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub build_options: String,
    /// Ordered build plugin hints; each named plugin must succeed in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_system: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Package>,
    /// Plugin-namespaced sub-objects, retrieved by plugin name.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, serde_json::Value>,
    /// Where the descriptor file was loaded from, if it came from disk.
    #[serde(skip)]
    pub path: Option<PathBuf>,
    #[serde(skip)]
    loaded: bool,
}

impl Package {
    /// Load a descriptor from `<dir>/<package_file>`.
    #[tracing::instrument(skip(runtime, opts))]
    pub fn load<R: Runtime>(runtime: &R, dir: &Path, opts: &Options) -> Result<Self> {
        let path = dir.join(&opts.package_file);
        let content = runtime
            .read_to_string(&path)
            .with_context(|| format!("unable to read package descriptor {:?}", path))?;
        let mut package = Self::parse(&content)
            .with_context(|| format!("invalid package descriptor {:?}", path))?;
        package.path = Some(path);
        Ok(package)
    }

    /// Parse a descriptor from JSON text and mark it (and its dependency
    /// records) loaded.
    pub fn parse(content: &str) -> Result<Self> {
        let mut package: Package = serde_json::from_str(content)?;
        package.mark_loaded();
        Ok(package)
    }

    fn mark_loaded(&mut self) {
        self.loaded = true;
        for dep in &mut self.dependencies {
            dep.mark_loaded();
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Fail fast when used before loading.
    pub fn ensure_loaded(&self) -> Result<(), Error> {
        if self.loaded { Ok(()) } else { Err(Error::ConfigNotLoaded) }
    }

    /// Count how many times `name` appears in this package's dependency
    /// tree, recursively.
    pub fn dependency_count(&self, name: &str) -> usize {
        let mut count = 0;
        for dep in &self.dependencies {
            if dep.name == name {
                count += 1;
            }
            count += dep.dependency_count(name);
        }
        count
    }

    /// Plugin-specific string from the descriptor: looks up
    /// `<plugin>.<key>`, falling back to a top-level `<key>`.
    pub fn plugin_value(&self, plugin: &str, key: &str) -> Option<String> {
        if let Some(value) = self
            .extensions
            .get(plugin)
            .and_then(|section| section.get(key))
            .and_then(|v| v.as_str())
        {
            return Some(value.to_string());
        }
        self.extensions
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
    }

    /// The name a plugin should address this package by: a plugin-specific
    /// override when declared, the package name otherwise.
    pub fn name_for_plugin(&self, plugin: &str) -> String {
        self.plugin_value(plugin, "name")
            .unwrap_or_else(|| self.name.clone())
    }

    /// Serialize the descriptor back to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("unable to serialize package descriptor")
    }
}
