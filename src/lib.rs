//! modinstall - module installation engine
//!
//! Brings an application's set of pluggable modules into a consistent,
//! persisted installation state:
//!
//! 1. **Registry**: discover modules and parse their `module.toml` manifests
//! 2. **Dependency graph**: resolve a requested set into an activation order
//! 3. **State tracking**: derive per-module lifecycle states from the
//!    persisted module table and the run's directives
//! 4. **Loading**: register schema, import fixtures and translations, and
//!    checkpoint each module with its own commit
//!
//! Schema registration, fixture parsing, translation import and entity
//! persistence are external collaborators, plugged in through the traits in
//! [`module::traits`].

pub mod config;
pub mod module;
pub mod storage;
pub mod utils;

pub use config::LoaderConfig;
pub use module::{
    Collaborators, Directives, InstallState, LoadReport, ModuleError, ModuleManager,
    ModuleRegistry, SharedRegistry,
};
pub use storage::{Storage, Transaction};
