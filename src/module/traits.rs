//! Module system traits and interfaces
//!
//! Defines the errors of the module system and the narrow interfaces through
//! which the installer drives its external collaborators: class registration,
//! fixture import, translation import and entity persistence.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::module::state::InstallState;
use crate::storage::Transaction;

/// One schema entity (model, wizard, report...) contributed by a module
pub trait SchemaEntity: Send + Sync {
    /// Fully qualified entity name, e.g. `sale.order`
    fn name(&self) -> &str;

    /// Create or migrate the entity's persisted structure on behalf of `module`
    fn register(&self, module: &str, txn: &mut Transaction) -> anyhow::Result<()>;

    /// Whether the entity keeps a history/audit table
    fn tracks_history(&self) -> bool {
        false
    }
}

/// Process-wide class registry ("pool")
pub trait ClassPool: Send + Sync {
    /// Entities contributed by `module`, in registration order
    fn setup(&self, module: &str) -> anyhow::Result<Vec<Arc<dyn SchemaEntity>>>;
}

/// Scope a fixture import runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportScope {
    pub module: String,
    pub state: InstallState,
}

/// Reference to one persisted record
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordRef {
    pub model: String,
    pub db_id: u64,
}

impl RecordRef {
    pub fn new(model: impl Into<String>, db_id: u64) -> Self {
        Self {
            model: model.into(),
            db_id,
        }
    }
}

/// Fixture-data parser
///
/// Creates or updates records from one data file. Implementations record the
/// provenance of created records through `ModelDataStore` on `txn`.
pub trait FixtureImporter: Send + Sync {
    /// Import one data stream and return records previously imported by this
    /// module that the stream no longer references. They are deleted by the
    /// installer only after every module has been loaded.
    fn parse(
        &self,
        scope: &ImportScope,
        txn: &mut Transaction,
        stream: &mut dyn Read,
    ) -> anyhow::Result<Vec<RecordRef>>;
}

/// Translation catalog importer
pub trait TranslationImporter: Send + Sync {
    fn import_catalog(
        &self,
        language: &str,
        module: &str,
        file: &Path,
        txn: &mut Transaction,
    ) -> anyhow::Result<()>;
}

/// Entity-level persistence operations
pub trait EntityStore: Send + Sync {
    /// Delete records of `entity` through the entity's own delete operation
    fn delete(&self, txn: &mut Transaction, entity: &str, ids: &[u64]) -> anyhow::Result<()>;

    /// Rebuild the history table of `entity` from its current schema
    fn rebuild_history(&self, txn: &mut Transaction, entity: &str) -> anyhow::Result<()>;
}

/// Registration capability a module implements to contribute its classes
pub trait ModuleRegistration: Send + Sync {
    fn register(&self, module: &str) -> anyhow::Result<()>;
}

/// Externally plugged-in source of modules (installed packages, bundles...)
pub trait ModuleSource: Send + Sync {
    /// Short label used in logs
    fn label(&self) -> &str;

    /// `(module name, module directory)` pairs this source provides
    fn locate(&self) -> anyhow::Result<Vec<(String, PathBuf)>>;
}

/// Manifest errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Module {name} has no manifest in {}", .path.display())]
    Missing { name: String, path: PathBuf },

    #[error("Failed to read manifest {}: {message}", .path.display())]
    Unreadable { path: PathBuf, message: String },

    #[error("Failed to parse manifest {}: {message}", .path.display())]
    Malformed { path: PathBuf, message: String },

    #[error("Module {0} lists itself as a dependency")]
    SelfDependency(String),
}

/// Dependency resolution errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module dependency missing: {missing} (required by {module})")]
    MissingDependency { module: String, missing: String },

    #[error("Circular dependency detected at module {0}")]
    CircularDependency(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Step of the per-module load sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Register,
    Fixtures,
    Translations,
    Checkpoint,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoadStage::Register => "schema registration",
            LoadStage::Fixtures => "fixture import",
            LoadStage::Translations => "translation import",
            LoadStage::Checkpoint => "state checkpoint",
        };
        f.write_str(label)
    }
}

/// Errors raised while the installer is applying changes
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to load module {module} during {stage}: {source}")]
    Module {
        module: String,
        stage: LoadStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("History rebuild failed for {entity}: {source}")]
    History {
        entity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Deferred cleanup failed for module {module}: {source}")]
    Cleanup {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Removal of module {module} failed: {source}")]
    Removal {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl LoadError {
    /// Module the error is attributed to, if any
    pub fn module(&self) -> Option<&str> {
        match self {
            LoadError::Module { module, .. }
            | LoadError::Cleanup { module, .. }
            | LoadError::Removal { module, .. } => Some(module),
            LoadError::History { .. } | LoadError::Storage(_) => None,
        }
    }
}

/// Development watcher errors (never escalated past the watcher)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatcherError {
    #[error("Registry rescan failed: {0}")]
    Rescan(String),

    #[error("Module {module} cannot be reloaded: {reason}")]
    NotReloadable { module: String, reason: String },
}

/// Module system errors
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Module registry lock poisoned")]
    RegistryPoisoned,

    #[error("Module operation failed: {0}")]
    OperationError(String),
}

impl From<anyhow::Error> for ModuleError {
    fn from(e: anyhow::Error) -> Self {
        ModuleError::OperationError(e.to_string())
    }
}
