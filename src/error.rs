//! Core failure kinds.
//!
//! Operations still flow through `anyhow::Result` for context chaining; these
//! variants name the failures that callers and tests need to distinguish.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An operation was attempted on a descriptor that was never loaded.
    #[error("package descriptor is not loaded")]
    ConfigNotLoaded,

    /// A build or install directory could not be created. Fatal for a build.
    #[error("unable to create directory {path:?}")]
    PathCreation { path: PathBuf },

    /// No enabled plugin performed the requested lifecycle action.
    #[error("no enabled plugin handled [{action}]")]
    PluginDispatch { action: &'static str },

    /// Persisting or reading a meta record failed.
    #[error("unable to persist meta record for {name}")]
    MetadataIo { name: String },

    /// Removal was blocked because other installed packages still depend on
    /// this one.
    #[error("{count} package(s) depend on {name}")]
    StillReferenced { name: String, count: usize },

    /// The declared executable is absent from the shared bin namespace or
    /// lacks the executable bit.
    #[error("{path:?} is missing or not executable")]
    ExecutableMissing { path: PathBuf },

    /// A plugin process did not exit cleanly with status zero.
    #[error("plugin {name} failed: {reason}")]
    AbnormalTermination { name: String, reason: String },
}
