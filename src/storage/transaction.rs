//! Staged transactions over the key/value store
//!
//! Writes are buffered in an overlay and only reach the database on
//! `commit`. Reads see the overlay first, so a transaction always observes
//! its own uncommitted writes. Dropping a transaction with pending writes
//! discards them, which is the rollback-to-last-commit behavior the loader
//! relies on when a module fails half way.

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::storage::database::{Database, WriteBatch};

/// User id of the system identity
pub const ROOT_USER: u64 = 0;

/// An open transactional scope
pub struct Transaction {
    db: Arc<dyn Database>,
    /// (tree, key) -> Some(value) for puts, None for deletes
    pending: BTreeMap<(String, Vec<u8>), Option<Vec<u8>>>,
    user: u64,
    context: BTreeMap<String, String>,
    depth: usize,
    commits: u64,
}

impl Transaction {
    pub(crate) fn new(db: Arc<dyn Database>, user: u64) -> Self {
        Self {
            db,
            pending: BTreeMap::new(),
            user,
            context: BTreeMap::new(),
            depth: 0,
            commits: 0,
        }
    }

    /// Open an independent scope on the same database, running as the root
    /// user with an empty request context.
    ///
    /// The nested scope commits on its own; the enclosing transaction's
    /// pending writes are neither visible to it nor affected by it.
    pub fn nested(&self) -> Transaction {
        debug!(
            "Opening nested transaction (depth {}) as root user",
            self.depth + 1
        );
        Transaction {
            db: Arc::clone(&self.db),
            pending: BTreeMap::new(),
            user: ROOT_USER,
            context: BTreeMap::new(),
            depth: self.depth + 1,
            commits: 0,
        }
    }

    pub fn user(&self) -> u64 {
        self.user
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn set_context(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.insert(key.into(), value.into());
    }

    /// Number of successful commits made through this scope
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Whether writes are waiting for a commit
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Read a value, overlay first
    pub fn get(&self, tree: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.pending.get(&(tree.to_string(), key.to_vec())) {
            return Ok(staged.clone());
        }
        self.db.open_tree(tree)?.get(key)
    }

    /// Stage an insert or overwrite
    pub fn put(&mut self, tree: &str, key: Vec<u8>, value: Vec<u8>) {
        self.pending.insert((tree.to_string(), key), Some(value));
    }

    /// Stage a deletion
    pub fn delete(&mut self, tree: &str, key: Vec<u8>) {
        self.pending.insert((tree.to_string(), key), None);
    }

    /// All entries of a tree in key order, with staged writes applied
    pub fn scan(&self, tree: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for item in self.db.open_tree(tree)?.iter() {
            let (key, value) = item?;
            merged.insert(key, value);
        }
        for ((staged_tree, key), staged) in &self.pending {
            if staged_tree != tree {
                continue;
            }
            match staged {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Allocate the next id of a named sequence (ids start at 1)
    pub fn next_id(&mut self, sequence: &str) -> Result<u64> {
        use crate::storage::database::SEQUENCES_TREE;

        let current = match self.get(SEQUENCES_TREE, sequence.as_bytes())? {
            Some(bytes) => decode_id(&bytes)?,
            None => 0,
        };
        let next = current + 1;
        self.put(
            SEQUENCES_TREE,
            sequence.as_bytes().to_vec(),
            encode_id(next).to_vec(),
        );
        Ok(next)
    }

    /// Write every staged change atomically and start a fresh boundary
    pub fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.commits += 1;
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for ((tree, key), staged) in &self.pending {
            match staged {
                Some(value) => batch.put(tree, key.clone(), value.clone()),
                None => batch.delete(tree, key.clone()),
            }
        }
        self.db.write_batch(&batch)?;
        debug!("Committed {} staged writes", batch.len());
        self.pending.clear();
        self.commits += 1;
        Ok(())
    }

    /// Discard everything staged since the last commit
    pub fn rollback(&mut self) {
        if !self.pending.is_empty() {
            debug!("Rolling back {} staged writes", self.pending.len());
        }
        self.pending.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "Transaction dropped with {} uncommitted writes; discarding",
                self.pending.len()
            );
        }
    }
}

/// Big-endian encoding keeps numeric ids in key order
pub fn encode_id(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

pub fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("invalid id encoding ({} bytes)", bytes.len()))?;
    Ok(u64::from_be_bytes(raw))
}
