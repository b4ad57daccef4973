//! Per-invocation context passed through every lifecycle call.

use std::path::PathBuf;

use crate::package;

/// Which repository root an invocation operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// The per-project `.kiln` directory found by walking up from the
    /// current directory.
    #[default]
    Local,
    /// The machine-wide shared root.
    Global,
}

/// Operator override controlling whether cached build state is honored.
///
/// `Project` bypasses the cache of the package the operation was invoked on;
/// its dependencies still honor their caches. `All` bypasses caches for the
/// whole dependency tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Force {
    #[default]
    None,
    Project,
    All,
}

impl Force {
    /// Map a counted `-f` flag to a force level (`-f` = Project, `-ff` = All).
    pub fn from_count(count: u8) -> Self {
        match count {
            0 => Force::None,
            1 => Force::Project,
            _ => Force::All,
        }
    }
}

/// Options are built once from the command line and never mutated during a
/// dependency traversal.
#[derive(Debug, Clone)]
pub struct Options {
    pub scope: Scope,
    pub force: Force,
    pub verbose: bool,
    /// Descriptor file name looked up inside a package directory.
    pub package_file: String,
    /// Target location named on the command line, if any.
    pub location: Option<PathBuf>,
    /// Accept defaults instead of prompting.
    pub assume_defaults: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scope: Scope::default(),
            force: Force::default(),
            verbose: false,
            package_file: package::DESCRIPTOR_FILE.to_string(),
            location: None,
            assume_defaults: false,
        }
    }
}

impl Options {
    /// Derive the options a dependency is processed with: `Project` force
    /// applies only to the package named on the command line, so it drops to
    /// `None` when descending; `All` is preserved.
    pub fn for_dependency(&self) -> Options {
        let mut opts = self.clone();
        opts.force = match self.force {
            Force::All => Force::All,
            _ => Force::None,
        };
        opts
    }
}
