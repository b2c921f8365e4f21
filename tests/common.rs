//! Shared fixtures for integration tests
//!
//! Recording collaborators plus a temporary workspace holding module
//! directories and a database.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use modinstall::module::registry::{BuiltinModule, ModuleRegistry, SharedRegistry};
use modinstall::module::traits::{
    ClassPool, EntityStore, FixtureImporter, ImportScope, RecordRef, SchemaEntity,
    TranslationImporter,
};
use modinstall::module::{Collaborators, ModuleManager};
use modinstall::storage::{ModelDataStore, Storage, Transaction};

/// Ordered log of every collaborator call
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Events starting with `prefix`
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(prefix))
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub struct RecordingEntity {
    name: String,
    history: bool,
    journal: Journal,
}

impl SchemaEntity for RecordingEntity {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, module: &str, _txn: &mut Transaction) -> anyhow::Result<()> {
        self.journal.push(format!("register:{}:{}", module, self.name));
        Ok(())
    }

    fn tracks_history(&self) -> bool {
        self.history
    }
}

/// Class pool returning configured entities per module
#[derive(Default)]
pub struct RecordingPool {
    journal: Journal,
    entities: BTreeMap<String, Vec<(String, bool)>>,
    failing: BTreeSet<String>,
}

impl RecordingPool {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Default::default()
        }
    }

    pub fn entity(mut self, module: &str, entity: &str, history: bool) -> Self {
        self.entities
            .entry(module.to_string())
            .or_default()
            .push((entity.to_string(), history));
        self
    }

    pub fn failing(mut self, module: &str) -> Self {
        self.failing.insert(module.to_string());
        self
    }
}

impl ClassPool for RecordingPool {
    fn setup(&self, module: &str) -> anyhow::Result<Vec<Arc<dyn SchemaEntity>>> {
        self.journal.push(format!("setup:{}", module));
        if self.failing.contains(module) {
            anyhow::bail!("schema of {} is broken", module);
        }
        Ok(self
            .entities
            .get(module)
            .map(|entities| {
                entities
                    .iter()
                    .map(|(name, history)| {
                        Arc::new(RecordingEntity {
                            name: name.clone(),
                            history: *history,
                            journal: self.journal.clone(),
                        }) as Arc<dyn SchemaEntity>
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Line-based fixture format:
///
/// ```text
/// create <model> <db_id>
/// stale <model> <db_id>
/// ```
///
/// `create` records provenance, `stale` is returned for deferred deletion.
pub struct RecordingFixtures {
    journal: Journal,
}

impl FixtureImporter for RecordingFixtures {
    fn parse(
        &self,
        scope: &ImportScope,
        txn: &mut Transaction,
        stream: &mut dyn Read,
    ) -> anyhow::Result<Vec<RecordRef>> {
        let mut text = String::new();
        stream.read_to_string(&mut text)?;
        self.journal
            .push(format!("fixture:{}:{}", scope.module, scope.state));
        self.journal
            .push(format!("txn:{}:{}", txn.user(), txn.context().len()));

        let mut stale = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["create", model, id] => {
                    let db_id: u64 = id.parse()?;
                    let known = ModelDataStore::for_module(txn, &scope.module)?
                        .iter()
                        .any(|row| row.model == *model && row.db_id == db_id);
                    if !known {
                        ModelDataStore::record(txn, &scope.module, model, db_id)?;
                    }
                }
                ["stale", model, id] => stale.push(RecordRef::new(*model, id.parse()?)),
                ["fail"] => anyhow::bail!("fixture of {} is broken", scope.module),
                _ => anyhow::bail!("bad fixture line: {}", line),
            }
        }
        Ok(stale)
    }
}

pub struct RecordingTranslations {
    journal: Journal,
}

impl TranslationImporter for RecordingTranslations {
    fn import_catalog(
        &self,
        language: &str,
        module: &str,
        file: &Path,
        _txn: &mut Transaction,
    ) -> anyhow::Result<()> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.journal
            .push(format!("translation:{}:{}:{}", language, module, file_name));
        Ok(())
    }
}

pub struct RecordingEntities {
    journal: Journal,
}

impl EntityStore for RecordingEntities {
    fn delete(&self, _txn: &mut Transaction, entity: &str, ids: &[u64]) -> anyhow::Result<()> {
        for id in ids {
            self.journal.push(format!("delete:{}:{}", entity, id));
        }
        Ok(())
    }

    fn rebuild_history(&self, _txn: &mut Transaction, entity: &str) -> anyhow::Result<()> {
        self.journal.push(format!("history:{}", entity));
        Ok(())
    }
}

pub fn collaborators(journal: &Journal, pool: RecordingPool) -> Collaborators {
    Collaborators {
        pool: Arc::new(pool),
        fixtures: Arc::new(RecordingFixtures {
            journal: journal.clone(),
        }),
        translations: Arc::new(RecordingTranslations {
            journal: journal.clone(),
        }),
        entities: Arc::new(RecordingEntities {
            journal: journal.clone(),
        }),
    }
}

/// Temporary module tree and database
pub struct Workspace {
    pub temp_dir: TempDir,
    pub modules_dir: PathBuf,
    pub core_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Workspace {
    /// Workspace with the built-in module `ir`
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let modules_dir = temp_dir.path().join("modules");
        let core_dir = temp_dir.path().join("core");
        let data_dir = temp_dir.path().join("data");
        fs::create_dir_all(&modules_dir).unwrap();
        fs::create_dir_all(core_dir.join("ir")).unwrap();
        Self {
            temp_dir,
            modules_dir,
            core_dir,
            data_dir,
        }
    }

    /// Write a module with a manifest and data files
    pub fn module(&self, name: &str, depends: &[&str], files: &[(&str, &str)]) -> PathBuf {
        self.module_with_extras(name, depends, &[], files)
    }

    pub fn module_with_extras(
        &self,
        name: &str,
        depends: &[&str],
        extras: &[&str],
        files: &[(&str, &str)],
    ) -> PathBuf {
        let dir = self.modules_dir.join(name);
        fs::create_dir_all(&dir).unwrap();
        let xml: Vec<&str> = files.iter().map(|(file, _)| *file).collect();
        let manifest = format!(
            "[module]\ndepends = {:?}\nextras_depend = {:?}\nxml = {:?}\n",
            depends, extras, xml
        );
        fs::write(dir.join("module.toml"), manifest).unwrap();
        for (file, content) in files {
            let path = dir.join(file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, content).unwrap();
        }
        dir
    }

    /// Overwrite one data file of an existing module
    pub fn rewrite(&self, module: &str, file: &str, content: &str) {
        fs::write(self.modules_dir.join(module).join(file), content).unwrap();
    }

    pub fn locale(&self, module: &str, language: &str) {
        let dir = self.modules_dir.join(module).join("locale");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(format!("{}.po", language)), "").unwrap();
    }

    pub fn registry(&self) -> SharedRegistry {
        let shared = SharedRegistry::new(ModuleRegistry::new(
            vec![self.modules_dir.clone()],
            vec![BuiltinModule::new("ir", self.core_dir.join("ir"))],
        ));
        shared.rescan().unwrap();
        shared
    }

    pub fn storage(&self) -> Arc<Storage> {
        Arc::new(Storage::new(&self.data_dir).unwrap())
    }

    pub fn manager(&self, journal: &Journal, pool: RecordingPool) -> ModuleManager {
        ModuleManager::new(self.registry(), self.storage(), collaborators(journal, pool))
    }
}
