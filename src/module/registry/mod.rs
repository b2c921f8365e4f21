//! Module registry and discovery
//!
//! Handles module discovery, manifest parsing, and dependency resolution.

pub mod dependencies;
pub mod discovery;
pub mod manifest;

pub use dependencies::{DependencyGraph, GraphNode, ModuleDependencies};
pub use discovery::{BuiltinModule, ModuleRegistry, SharedRegistry, StaticSource};
pub use manifest::{ModuleDescriptor, ModuleManifest};
