//! Storage layer for the module installer
//!
//! Persists the module table and the fixture provenance table.
//! Supports multiple database backends via feature flags (sled, redb).

pub mod database;
pub mod model_data;
pub mod modules;
pub mod transaction;

use anyhow::Result;
use database::{create_database, default_backend, fallback_backend, Database, DatabaseBackend};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub use model_data::{ModelData, ModelDataStore};
pub use modules::{ModuleRecord, ModuleStore};
pub use transaction::{Transaction, ROOT_USER};

/// Storage manager handing out transactions on one database
pub struct Storage {
    db: Arc<dyn Database>,
    backend: DatabaseBackend,
}

impl Storage {
    /// Create a new storage instance with default backend
    ///
    /// Attempts to use the default backend (redb), and gracefully falls back
    /// to sled if redb fails and sled is available.
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let default = default_backend();

        match Self::with_backend(data_dir.as_ref(), default) {
            Ok(storage) => Ok(storage),
            Err(e) => {
                if let Some(fallback_backend) = fallback_backend(default) {
                    warn!(
                        "Failed to initialize {:?} backend: {}. Falling back to {:?}.",
                        default, e, fallback_backend
                    );
                    info!(
                        "Attempting to initialize storage with fallback backend: {:?}",
                        fallback_backend
                    );
                    Self::with_backend(data_dir, fallback_backend)
                } else {
                    Err(anyhow::anyhow!(
                        "Failed to initialize {:?} backend: {}. No fallback backend available.",
                        default,
                        e
                    ))
                }
            }
        }
    }

    /// Create a new storage instance with specified backend
    pub fn with_backend<P: AsRef<Path>>(data_dir: P, backend: DatabaseBackend) -> Result<Self> {
        let db = Arc::from(create_database(data_dir, backend)?);
        Ok(Self { db, backend })
    }

    /// Wrap an already opened database
    pub fn from_database(db: Arc<dyn Database>, backend: DatabaseBackend) -> Self {
        Self { db, backend }
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    /// Start a top-level transaction acting as `user`
    pub fn begin(&self, user: u64) -> Transaction {
        Transaction::new(Arc::clone(&self.db), user)
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<()> {
        self.db.flush()
    }
}
