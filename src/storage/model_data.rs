//! Provenance of fixture-created records
//!
//! Every record a module's fixture data creates is remembered here as
//! `(module, model, db_id)`. Row ids come from a sequence, so key order is
//! creation order. The removal pass walks this table backwards.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::storage::database::MODEL_DATA_TREE;
use crate::storage::transaction::{encode_id, Transaction};

/// One provenance row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelData {
    pub id: u64,
    pub module: String,
    pub model: String,
    pub db_id: u64,
}

/// Accessor for the provenance table
pub struct ModelDataStore;

impl ModelDataStore {
    /// Record that `module` created record `db_id` of entity `model`
    pub fn record(txn: &mut Transaction, module: &str, model: &str, db_id: u64) -> Result<ModelData> {
        let row = ModelData {
            id: txn.next_id(MODEL_DATA_TREE)?,
            module: module.to_string(),
            model: model.to_string(),
            db_id,
        };
        txn.put(
            MODEL_DATA_TREE,
            encode_id(row.id).to_vec(),
            bincode::serialize(&row)?,
        );
        Ok(row)
    }

    /// Rows created by `module`, oldest first
    pub fn for_module(txn: &Transaction, module: &str) -> Result<Vec<ModelData>> {
        let mut rows = Vec::new();
        for (_, data) in txn.scan(MODEL_DATA_TREE)? {
            let row: ModelData = bincode::deserialize(&data)?;
            if row.module == module {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Rows created by `module`, most recent first
    pub fn for_module_newest_first(txn: &Transaction, module: &str) -> Result<Vec<ModelData>> {
        let mut rows = Self::for_module(txn, module)?;
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    pub fn remove(txn: &mut Transaction, id: u64) {
        txn.delete(MODEL_DATA_TREE, encode_id(id).to_vec());
    }

    /// Drop the provenance of one record owned by `module`
    pub fn forget(txn: &mut Transaction, module: &str, model: &str, db_id: u64) -> Result<usize> {
        let matching: Vec<u64> = Self::for_module(txn, module)?
            .into_iter()
            .filter(|row| row.model == model && row.db_id == db_id)
            .map(|row| row.id)
            .collect();
        for id in &matching {
            Self::remove(txn, *id);
        }
        Ok(matching.len())
    }
}
