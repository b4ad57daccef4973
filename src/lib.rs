pub mod environment;
pub mod error;
pub mod options;
pub mod orchestrator;
pub mod package;
pub mod plugin;
pub mod repository;
pub mod runtime;
