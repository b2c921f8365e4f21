//! Module system
//!
//! Discovers modules, resolves their dependencies, tracks their lifecycle
//! state and loads them into the persisted installation.
//!
//! ## Architecture
//!
//! - **Registry**: catalog of available modules, rebuilt by explicit re-scan
//! - **Dependency graph**: deterministic, cycle-checked activation order
//! - **State tracking**: lifecycle state per module, propagated to dependents
//! - **Loader**: drives the external collaborators with per-module commits
//! - **Manager**: composition root tying the above to storage

pub mod loader;
pub mod manager;
pub mod plugins;
pub mod registry;
pub mod state;
pub mod traits;
pub mod watcher;

pub use loader::{Collaborators, LoadReport, ModuleLoader};
pub use manager::ModuleManager;
pub use plugins::{FnRegistration, PluginTable};
pub use registry::{
    DependencyGraph, ModuleDependencies, ModuleDescriptor, ModuleRegistry, SharedRegistry,
};
pub use state::{Directives, InstallState, StateTracker};
pub use traits::{
    ClassPool, EntityStore, FixtureImporter, ImportScope, LoadError, ManifestError, ModuleError,
    ModuleRegistration, RecordRef, ResolutionError, SchemaEntity, TranslationImporter,
    WatcherError,
};
pub use watcher::ModuleWatcher;
