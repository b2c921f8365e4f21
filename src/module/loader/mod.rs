//! Module loading
//!
//! Drives pending modules of a resolved graph through the collaborators and
//! runs the removal pass.

pub mod loader;

pub use loader::{Collaborators, LoadReport, ModuleLoader};
