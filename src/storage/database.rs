//! Database abstraction layer
//!
//! Provides a unified interface for different database backends (sled, redb).
//! Allows switching between storage engines via feature flags.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Module table: module name -> `ModuleRecord`
pub const MODULES_TREE: &str = "modules";
/// Provenance table: big-endian row id -> `ModelData`
pub const MODEL_DATA_TREE: &str = "model_data";
/// Id sequences: sequence name -> big-endian next id
pub const SEQUENCES_TREE: &str = "sequences";

/// Database abstraction trait
///
/// Provides a unified interface for key-value storage operations
/// that can be implemented by different backends (sled, redb).
pub trait Database: Send + Sync {
    /// Open a named tree/table
    fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>>;

    /// Apply a batch of writes spanning several trees.
    ///
    /// This is the commit primitive used by `Transaction`.
    fn write_batch(&self, batch: &WriteBatch) -> Result<()>;

    /// Flush all pending writes
    fn flush(&self) -> Result<()>;
}

/// Read view of one named table
///
/// Writes never go through a tree; they are staged by `Transaction` and
/// applied with `Database::write_batch`.
pub trait Tree: Send + Sync {
    /// Get a value by key
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Iterate over all key-value pairs in key order
    fn iter(&self) -> Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_>;
}

/// One staged write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { tree: String, key: Vec<u8>, value: Vec<u8> },
    Delete { tree: String, key: Vec<u8> },
}

impl BatchOp {
    pub fn tree(&self) -> &str {
        match self {
            BatchOp::Put { tree, .. } | BatchOp::Delete { tree, .. } => tree,
        }
    }
}

/// Ordered set of writes applied by `Database::write_batch`
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, tree: &str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            tree: tree.to_string(),
            key,
            value,
        });
    }

    pub fn delete(&mut self, tree: &str, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete {
            tree: tree.to_string(),
            key,
        });
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Database backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    Sled,
    Redb,
}

/// Create a database instance based on backend type
pub fn create_database<P: AsRef<Path>>(
    data_dir: P,
    backend: DatabaseBackend,
) -> Result<Box<dyn Database>> {
    match backend {
        #[cfg(feature = "sled")]
        DatabaseBackend::Sled => Ok(Box::new(sled_impl::SledDatabase::new(data_dir)?)),
        #[cfg(not(feature = "sled"))]
        DatabaseBackend::Sled => {
            let _ = data_dir;
            Err(anyhow::anyhow!(
                "Sled backend not available (feature not enabled)"
            ))
        }
        #[cfg(feature = "redb")]
        DatabaseBackend::Redb => Ok(Box::new(redb_impl::RedbDatabase::new(data_dir)?)),
        #[cfg(not(feature = "redb"))]
        DatabaseBackend::Redb => {
            let _ = data_dir;
            Err(anyhow::anyhow!(
                "Redb backend not available (feature not enabled)"
            ))
        }
    }
}

/// Get default database backend
///
/// Returns the preferred backend (redb if available, otherwise sled).
pub fn default_backend() -> DatabaseBackend {
    #[cfg(feature = "redb")]
    {
        DatabaseBackend::Redb
    }
    #[cfg(all(not(feature = "redb"), feature = "sled"))]
    {
        DatabaseBackend::Sled
    }
    #[cfg(all(not(feature = "redb"), not(feature = "sled")))]
    {
        // Fails gracefully in create_database() with a clear error message
        DatabaseBackend::Redb
    }
}

/// Get fallback database backend
///
/// Returns an alternative backend if the primary fails.
pub fn fallback_backend(primary: DatabaseBackend) -> Option<DatabaseBackend> {
    match primary {
        DatabaseBackend::Redb => {
            #[cfg(feature = "sled")]
            {
                Some(DatabaseBackend::Sled)
            }
            #[cfg(not(feature = "sled"))]
            {
                None
            }
        }
        DatabaseBackend::Sled => {
            #[cfg(feature = "redb")]
            {
                Some(DatabaseBackend::Redb)
            }
            #[cfg(not(feature = "redb"))]
            {
                None
            }
        }
    }
}

// Sled implementation
#[cfg(feature = "sled")]
mod sled_impl {
    use super::{BatchOp, Database, Tree, WriteBatch};
    use anyhow::Result;
    use sled::Db;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    pub struct SledDatabase {
        db: Arc<Db>,
    }

    impl SledDatabase {
        pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
            let db = sled::open(data_dir.as_ref().join("sled"))?;
            Ok(Self { db: Arc::new(db) })
        }
    }

    impl Database for SledDatabase {
        fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>> {
            let tree = self.db.open_tree(name)?;
            Ok(Box::new(SledTree {
                tree: Arc::new(tree),
            }))
        }

        fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
            // sled batches are atomic per tree; group ops while keeping their order
            let mut per_tree: BTreeMap<&str, sled::Batch> = BTreeMap::new();
            for op in batch.ops() {
                let tree_batch = per_tree.entry(op.tree()).or_default();
                match op {
                    BatchOp::Put { key, value, .. } => {
                        tree_batch.insert(key.as_slice(), value.as_slice())
                    }
                    BatchOp::Delete { key, .. } => tree_batch.remove(key.as_slice()),
                }
            }
            for (name, tree_batch) in per_tree {
                self.db.open_tree(name)?.apply_batch(tree_batch)?;
            }
            self.db.flush()?;
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            self.db.flush()?;
            Ok(())
        }
    }

    struct SledTree {
        tree: Arc<sled::Tree>,
    }

    impl Tree for SledTree {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.tree.get(key)?.map(|v| v.to_vec()))
        }

        fn iter(&self) -> Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_> {
            Box::new(self.tree.iter().map(|item| {
                item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                    .map_err(|e| anyhow::anyhow!("Sled iteration error: {}", e))
            }))
        }
    }
}

// Redb implementation
#[cfg(feature = "redb")]
mod redb_impl {
    use super::{BatchOp, Database, Tree, WriteBatch};
    use anyhow::Result;
    use redb::{Database as RedbDb, ReadableTable, TableDefinition};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    // Table definitions must be static; every table the installer uses
    static MODULES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("modules");
    static MODEL_DATA_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("model_data");
    static SEQUENCES_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sequences");

    fn table_def(
        name: &str,
    ) -> Result<&'static TableDefinition<'static, &'static [u8], &'static [u8]>> {
        match name {
            "modules" => Ok(&MODULES_TABLE),
            "model_data" => Ok(&MODEL_DATA_TABLE),
            "sequences" => Ok(&SEQUENCES_TABLE),
            _ => Err(anyhow::anyhow!(
                "Unknown table name: {}. Redb requires pre-defined tables.",
                name
            )),
        }
    }

    pub struct RedbDatabase {
        db: Arc<RedbDb>,
    }

    impl RedbDatabase {
        pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
            // One creation at a time per process
            static DB_CREATE_MUTEX: Mutex<()> = Mutex::new(());
            let _guard = DB_CREATE_MUTEX
                .lock()
                .map_err(|_| anyhow::anyhow!("database creation lock poisoned"))?;

            std::fs::create_dir_all(data_dir.as_ref())?;
            let db_path = data_dir.as_ref().join("modinstall.redb");
            let db = if db_path.exists() {
                RedbDb::open(&db_path)?
            } else {
                RedbDb::create(&db_path)?
            };

            // Open all tables once so that read transactions never miss them
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(MODULES_TABLE)?;
                let _ = write_txn.open_table(MODEL_DATA_TABLE)?;
                let _ = write_txn.open_table(SEQUENCES_TABLE)?;
            }
            write_txn.commit()?;

            Ok(Self { db: Arc::new(db) })
        }
    }

    impl Database for RedbDatabase {
        fn open_tree(&self, name: &str) -> Result<Box<dyn Tree>> {
            let table_def = table_def(name)?;
            Ok(Box::new(RedbTree {
                db: Arc::clone(&self.db),
                table_def,
            }))
        }

        fn write_batch(&self, batch: &WriteBatch) -> Result<()> {
            // One write transaction for the whole batch: all or nothing
            let write_txn = self.db.begin_write()?;
            for op in batch.ops() {
                let mut table = write_txn.open_table(*table_def(op.tree())?)?;
                match op {
                    BatchOp::Put { key, value, .. } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Delete { key, .. } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
            write_txn.commit()?;
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            // Redb flushes automatically on transaction commit
            Ok(())
        }
    }

    struct RedbTree {
        db: Arc<RedbDb>,
        table_def: &'static TableDefinition<'static, &'static [u8], &'static [u8]>,
    }

    impl Tree for RedbTree {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            let read_txn = self.db.begin_read()?;
            let table = read_txn.open_table(*self.table_def)?;
            let result = table.get(key)?.map(|v| v.value().to_vec());
            Ok(result)
        }

        fn iter(&self) -> Box<dyn Iterator<Item = Result<(Vec<u8>, Vec<u8>)>> + '_> {
            // The read transaction must outlive the range, so collect eagerly
            let read_txn = match self.db.begin_read() {
                Ok(txn) => txn,
                Err(e) => {
                    return Box::new(std::iter::once(Err(anyhow::anyhow!(
                        "Failed to begin read transaction: {}",
                        e
                    ))));
                }
            };

            let table = match read_txn.open_table(*self.table_def) {
                Ok(tbl) => tbl,
                Err(e) => {
                    return Box::new(std::iter::once(Err(anyhow::anyhow!(
                        "Failed to open table: {}",
                        e
                    ))));
                }
            };

            let mut items = Vec::new();
            match table.range::<&[u8]>(..) {
                Ok(range_iter) => {
                    for item_result in range_iter {
                        match item_result {
                            Ok((key, value)) => {
                                items.push(Ok((key.value().to_vec(), value.value().to_vec())));
                            }
                            Err(e) => {
                                items.push(Err(anyhow::anyhow!("Redb iteration error: {}", e)));
                            }
                        }
                    }
                }
                Err(e) => {
                    items.push(Err(anyhow::anyhow!("Failed to create range: {}", e)));
                }
            }

            Box::new(items.into_iter())
        }
    }
}
