//! Out-of-process plugins.
//!
//! A plugin is an external executable living in its own directory under the
//! repository's plugin namespace, described by a `manifest.json`. Every
//! lifecycle action the orchestrator cannot perform itself is offered to
//! plugins through a fixed capability interface; the mechanics of talking to
//! the plugin process live in [`host`].

pub mod host;
pub(crate) mod protocol;
pub mod registry;

pub use host::PluginHost;
pub use registry::PluginRegistry;

use std::fmt;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// What a plugin is for; gates which hooks are offered to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Declared no usable type; never offered any hook.
    #[default]
    Internal,
    /// Configures builds (answers the build hook only).
    Configuration,
    /// Materializes dependencies without a build (add/remove).
    Dependency,
    /// Resolves a package location to a local source directory.
    Resolver,
    /// Drives a build system (build/test/install).
    Build,
}

/// The fixed set of lifecycle actions a plugin can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Load,
    Unload,
    Add,
    Remove,
    Resolve,
    Build,
    Test,
    Install,
}

impl Hook {
    pub fn as_str(self) -> &'static str {
        match self {
            Hook::Load => "load",
            Hook::Unload => "unload",
            Hook::Add => "add",
            Hook::Remove => "remove",
            Hook::Resolve => "resolve",
            Hook::Build => "build",
            Hook::Test => "test",
            Hook::Install => "install",
        }
    }

    /// Whether a plugin of the given kind is offered this hook at all.
    pub fn supported_by(self, kind: PluginKind) -> bool {
        match self {
            Hook::Load | Hook::Unload => kind != PluginKind::Internal,
            Hook::Add | Hook::Remove => kind == PluginKind::Dependency,
            Hook::Resolve => kind == PluginKind::Resolver,
            Hook::Build => matches!(kind, PluginKind::Build | PluginKind::Configuration),
            Hook::Test | Hook::Install => kind == PluginKind::Build,
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin directory's `manifest.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Path to the plugin executable, relative to the plugin directory.
    /// A plugin without one is permanently invalid.
    #[serde(default)]
    pub executable: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, rename = "type")]
    pub kind: PluginKind,
}

fn default_enabled() -> bool {
    true
}

impl Manifest {
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).context("invalid plugin manifest")
    }
}

/// What came back from offering a hook to one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// The plugin performed the action, possibly returning values
    /// (e.g. a resolved source directory).
    Handled(Vec<String>),
    /// The plugin does not perform this action.
    Declined,
}

/// The capability interface every plugin implements.
///
/// [`PluginHost`] is the production implementation; tests substitute mocks.
#[cfg_attr(test, mockall::automock)]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn kind(&self) -> PluginKind;

    /// Perform one named lifecycle action. An `Err` means the plugin ran and
    /// failed; [`HookOutcome::Declined`] means it does not handle the action.
    fn run(&self, hook: Hook, args: &[String]) -> Result<HookOutcome>;
}
