//! Module table storage
//!
//! One `ModuleRecord` per known module, keyed by module name. Rows are
//! created the first time a module finishes installing and updated in place
//! afterwards.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::module::state::InstallState;
use crate::storage::database::MODULES_TREE;
use crate::storage::transaction::Transaction;

/// Persisted projection of a module's lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub id: u64,
    pub name: String,
    pub state: InstallState,
}

/// Accessor for the module table
pub struct ModuleStore;

impl ModuleStore {
    pub fn get(txn: &Transaction, name: &str) -> Result<Option<ModuleRecord>> {
        match txn.get(MODULES_TREE, name.as_bytes())? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Every record, ordered by module name
    pub fn all(txn: &Transaction) -> Result<Vec<ModuleRecord>> {
        txn.scan(MODULES_TREE)?
            .into_iter()
            .map(|(_, data)| bincode::deserialize(&data).map_err(Into::into))
            .collect()
    }

    /// name -> state for the given modules (absent modules are omitted)
    pub fn states_of<'a, I>(txn: &Transaction, names: I) -> Result<BTreeMap<String, InstallState>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut states = BTreeMap::new();
        for name in names {
            if let Some(record) = Self::get(txn, name)? {
                states.insert(record.name, record.state);
            }
        }
        Ok(states)
    }

    /// Names of every module currently in one of `states`
    pub fn names_in_states(txn: &Transaction, states: &[InstallState]) -> Result<Vec<String>> {
        Ok(Self::all(txn)?
            .into_iter()
            .filter(|record| states.contains(&record.state))
            .map(|record| record.name)
            .collect())
    }

    /// Update the state of an existing record, or insert a new one
    pub fn upsert_state(
        txn: &mut Transaction,
        name: &str,
        state: InstallState,
    ) -> Result<ModuleRecord> {
        let record = match Self::get(txn, name)? {
            Some(mut existing) => {
                existing.state = state;
                existing
            }
            None => ModuleRecord {
                id: txn.next_id(MODULES_TREE)?,
                name: name.to_string(),
                state,
            },
        };
        Self::put(txn, &record)?;
        Ok(record)
    }

    /// Update the state of an existing record; returns false when absent
    pub fn set_state(txn: &mut Transaction, name: &str, state: InstallState) -> Result<bool> {
        match Self::get(txn, name)? {
            Some(mut record) => {
                record.state = state;
                Self::put(txn, &record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn put(txn: &mut Transaction, record: &ModuleRecord) -> Result<()> {
        let data = bincode::serialize(record)?;
        txn.put(MODULES_TREE, record.name.as_bytes().to_vec(), data);
        Ok(())
    }
}
