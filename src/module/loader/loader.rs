//! Module graph loader
//!
//! Walks a resolved dependency graph and brings every pending module to
//! `installed`: schema registration, fixture import, translation import and
//! a state checkpoint, committed module by module. History rebuild and the
//! cleanup of stale fixture records run once the whole graph is loaded.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tracing::{debug, info};

use crate::module::registry::dependencies::DependencyGraph;
use crate::module::registry::manifest::{locale_catalogs, ModuleDescriptor};
use crate::module::state::{Directives, InstallState, StateTracker};
use crate::module::traits::{
    ClassPool, EntityStore, FixtureImporter, ImportScope, LoadError, LoadStage, RecordRef,
    TranslationImporter,
};
use crate::storage::{ModelDataStore, ModuleStore, Transaction};

/// External subsystems the loader drives
#[derive(Clone)]
pub struct Collaborators {
    pub pool: Arc<dyn ClassPool>,
    pub fixtures: Arc<dyn FixtureImporter>,
    pub translations: Arc<dyn TranslationImporter>,
    pub entities: Arc<dyn EntityStore>,
}

/// What one load run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Modules brought to `installed`, in load order
    pub installed: Vec<String>,
    /// Entities whose history table was rebuilt
    pub history_rebuilt: Vec<String>,
    /// Stale fixture records deleted after loading
    pub deleted: Vec<RecordRef>,
    /// Modules uninstalled by the removal pass
    pub removed: Vec<String>,
}

impl LoadReport {
    /// Whether the run changed nothing at all
    pub fn is_noop(&self) -> bool {
        self.installed.is_empty() && self.removed.is_empty() && self.deleted.is_empty()
    }
}

/// Stale records returned by the fixture importer for one module
struct PendingCleanup {
    module: String,
    records: Vec<RecordRef>,
}

/// Loads a dependency graph through the collaborators
pub struct ModuleLoader<'a> {
    collaborators: &'a Collaborators,
    locale_dir: String,
    locale_extension: String,
}

impl<'a> ModuleLoader<'a> {
    pub fn new(
        collaborators: &'a Collaborators,
        locale_dir: impl Into<String>,
        locale_extension: impl Into<String>,
    ) -> Self {
        Self {
            collaborators,
            locale_dir: locale_dir.into(),
            locale_extension: locale_extension.into(),
        }
    }

    /// Load every pending module of `graph`, in graph order.
    ///
    /// The computed `to_install`/`to_upgrade` markers are persisted and
    /// committed first, then each module ends with a commit of its own. A
    /// failure in one module keeps the modules before it installed and
    /// leaves the rest marked, so a later run without directives resumes
    /// them. On error the transaction is rolled back to the last commit and
    /// the error returned.
    pub fn load_module_graph(
        &self,
        graph: &DependencyGraph,
        txn: &mut Transaction,
        persisted: &BTreeMap<String, InstallState>,
        directives: &Directives,
        languages: &[String],
    ) -> Result<LoadReport, LoadError> {
        let mut states = StateTracker::compute_actions(persisted, graph, directives);
        let mut report = LoadReport::default();
        let mut history: BTreeSet<String> = BTreeSet::new();
        let mut cleanups: Vec<PendingCleanup> = Vec::new();

        if let Err(e) = Self::persist_markers(txn, persisted, &states) {
            txn.rollback();
            return Err(e);
        }

        for descriptor in graph.ordered() {
            let state = states
                .get(&descriptor.name)
                .copied()
                .unwrap_or(InstallState::NotInstalled);
            if !state.is_pending() {
                debug!("{}: {}, nothing to do", descriptor.name, state);
                continue;
            }
            info!("{}", descriptor.name);

            match self.load_module(
                descriptor,
                state,
                graph,
                &mut states,
                txn,
                &mut history,
                languages,
            ) {
                Ok(records) => {
                    cleanups.push(PendingCleanup {
                        module: descriptor.name.clone(),
                        records,
                    });
                    report.installed.push(descriptor.name.clone());
                }
                Err(e) => {
                    txn.rollback();
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.finalize(txn, &history, cleanups, &mut report) {
            txn.rollback();
            return Err(e);
        }

        Ok(report)
    }

    /// Write every pending state that differs from the persisted one
    fn persist_markers(
        txn: &mut Transaction,
        persisted: &BTreeMap<String, InstallState>,
        states: &BTreeMap<String, InstallState>,
    ) -> Result<(), LoadError> {
        let mut written = 0;
        for (name, state) in states {
            if !state.is_pending() || persisted.get(name) == Some(state) {
                continue;
            }
            debug!("{}: persisting {}", name, state);
            ModuleStore::upsert_state(txn, name, *state).map_err(LoadError::Storage)?;
            written += 1;
        }
        if written > 0 {
            txn.commit().map_err(LoadError::Storage)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn load_module(
        &self,
        descriptor: &ModuleDescriptor,
        state: InstallState,
        graph: &DependencyGraph,
        states: &mut BTreeMap<String, InstallState>,
        txn: &mut Transaction,
        history: &mut BTreeSet<String>,
        languages: &[String],
    ) -> Result<Vec<RecordRef>, LoadError> {
        let module = descriptor.name.as_str();
        let fail = |stage: LoadStage| {
            move |source: anyhow::Error| LoadError::Module {
                module: module.to_string(),
                stage,
                source,
            }
        };

        // Schema registration
        let entities = self
            .collaborators
            .pool
            .setup(module)
            .map_err(fail(LoadStage::Register))?;
        for entity in &entities {
            debug!("{}:register {}", module, entity.name());
            entity
                .register(module, txn)
                .map_err(fail(LoadStage::Register))?;
            if entity.tracks_history() {
                history.insert(entity.name().to_string());
            }
        }

        // Staged here, committed with this module's checkpoint
        for dependent in StateTracker::propagate(graph, module, state, states) {
            if let Some(marker) = states.get(&dependent).copied() {
                ModuleStore::upsert_state(txn, &dependent, marker)
                    .map_err(fail(LoadStage::Checkpoint))?;
            }
        }

        // Fixture data, in declared order
        let scope = ImportScope {
            module: module.to_string(),
            state,
        };
        let mut stale = Vec::new();
        for file in &descriptor.data_files {
            info!("{}:loading {}", module, file.display());
            let path = descriptor.data_file_path(file);
            let handle = File::open(&path)
                .map_err(|e| anyhow::anyhow!("cannot open {}: {}", path.display(), e))
                .map_err(fail(LoadStage::Fixtures))?;
            let mut reader = BufReader::new(handle);
            let records = self
                .collaborators
                .fixtures
                .parse(&scope, txn, &mut reader)
                .map_err(fail(LoadStage::Fixtures))?;
            stale.extend(records);
        }

        // Translations present on disk right now, requested languages only
        let catalogs = locale_catalogs(&descriptor.path, &self.locale_dir, &self.locale_extension)
            .map_err(anyhow::Error::from)
            .map_err(fail(LoadStage::Translations))?;
        for (language, file) in catalogs {
            if !languages.contains(&language) {
                continue;
            }
            info!(
                "{}:loading {}",
                module,
                file.strip_prefix(&descriptor.path)
                    .unwrap_or(file.as_path())
                    .display()
            );
            self.collaborators
                .translations
                .import_catalog(&language, module, &file, txn)
                .map_err(fail(LoadStage::Translations))?;
        }

        // Checkpoint
        ModuleStore::upsert_state(txn, module, InstallState::Installed)
            .map_err(fail(LoadStage::Checkpoint))?;
        txn.commit().map_err(fail(LoadStage::Checkpoint))?;
        states.insert(module.to_string(), InstallState::Installed);

        Ok(stale)
    }

    /// History rebuild, deferred deletions, final commit
    fn finalize(
        &self,
        txn: &mut Transaction,
        history: &BTreeSet<String>,
        cleanups: Vec<PendingCleanup>,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        report.history_rebuilt = self.rebuild_history(txn, history)?;
        report.deleted = self.delete_stale(txn, cleanups)?;
        txn.commit().map_err(LoadError::Storage)
    }

    fn rebuild_history(
        &self,
        txn: &mut Transaction,
        entities: &BTreeSet<String>,
    ) -> Result<Vec<String>, LoadError> {
        let mut rebuilt = Vec::new();
        for entity in entities {
            info!("history:update {}", entity);
            self.collaborators
                .entities
                .rebuild_history(txn, entity)
                .map_err(|source| LoadError::History {
                    entity: entity.clone(),
                    source,
                })?;
            rebuilt.push(entity.clone());
        }
        Ok(rebuilt)
    }

    /// Deferred deletions, most recently loaded module first
    fn delete_stale(
        &self,
        txn: &mut Transaction,
        mut cleanups: Vec<PendingCleanup>,
    ) -> Result<Vec<RecordRef>, LoadError> {
        let mut deleted = Vec::new();
        while let Some(PendingCleanup { module, records }) = cleanups.pop() {
            for record in records {
                let cleanup_error = |source: anyhow::Error| LoadError::Cleanup {
                    module: module.clone(),
                    source,
                };
                debug!("{}:delete {} {}", module, record.model, record.db_id);
                self.collaborators
                    .entities
                    .delete(txn, &record.model, &[record.db_id])
                    .map_err(cleanup_error)?;
                ModelDataStore::forget(txn, &module, &record.model, record.db_id)
                    .map_err(cleanup_error)?;
                deleted.push(record);
            }
        }
        Ok(deleted)
    }

    /// Uninstall every module persisted as `to_remove`.
    ///
    /// Records a module created are deleted newest first through the
    /// entity store, with a commit after each module. The modules are then
    /// marked `not_installed`.
    pub fn remove_modules(&self, txn: &mut Transaction) -> Result<Vec<String>, LoadError> {
        let result = self.remove_scheduled(txn);
        if result.is_err() {
            txn.rollback();
        }
        result
    }

    fn remove_scheduled(&self, txn: &mut Transaction) -> Result<Vec<String>, LoadError> {
        let names = ModuleStore::names_in_states(txn, &[InstallState::ToRemove])
            .map_err(LoadError::Storage)?;

        for name in &names {
            info!("{}:removing", name);
            let removal_error = |source: anyhow::Error| LoadError::Removal {
                module: name.clone(),
                source,
            };
            let rows = ModelDataStore::for_module_newest_first(txn, name).map_err(removal_error)?;
            for row in rows {
                debug!("{}:delete {} {}", name, row.model, row.db_id);
                self.collaborators
                    .entities
                    .delete(txn, &row.model, &[row.db_id])
                    .map_err(removal_error)?;
                ModelDataStore::remove(txn, row.id);
            }
            txn.commit().map_err(removal_error)?;
        }

        for name in &names {
            ModuleStore::set_state(txn, name, InstallState::NotInstalled)
                .map_err(LoadError::Storage)?;
        }
        txn.commit().map_err(LoadError::Storage)?;
        Ok(names)
    }
}

#[cfg(all(test, feature = "redb"))]
mod tests {
    use super::*;
    use crate::module::registry::{ModuleDependencies, ModuleDescriptor, ModuleRegistry};
    use crate::module::traits::SchemaEntity;
    use crate::storage::{Storage, ROOT_USER};
    use std::io::Read;
    use std::path::Path;
    use tempfile::TempDir;

    struct Pool {
        broken: &'static str,
    }

    impl ClassPool for Pool {
        fn setup(&self, module: &str) -> anyhow::Result<Vec<Arc<dyn SchemaEntity>>> {
            if module == self.broken {
                anyhow::bail!("broken schema");
            }
            Ok(Vec::new())
        }
    }

    struct Inert;

    impl FixtureImporter for Inert {
        fn parse(
            &self,
            _scope: &ImportScope,
            _txn: &mut Transaction,
            _stream: &mut dyn Read,
        ) -> anyhow::Result<Vec<RecordRef>> {
            Ok(Vec::new())
        }
    }

    impl TranslationImporter for Inert {
        fn import_catalog(
            &self,
            _language: &str,
            _module: &str,
            _file: &Path,
            _txn: &mut Transaction,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl EntityStore for Inert {
        fn delete(&self, _txn: &mut Transaction, _entity: &str, _ids: &[u64]) -> anyhow::Result<()> {
            Ok(())
        }

        fn rebuild_history(&self, _txn: &mut Transaction, _entity: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn collaborators(broken: &'static str) -> Collaborators {
        Collaborators {
            pool: Arc::new(Pool { broken }),
            fixtures: Arc::new(Inert),
            translations: Arc::new(Inert),
            entities: Arc::new(Inert),
        }
    }

    fn graph() -> DependencyGraph {
        let registry = ModuleRegistry::from_descriptors(
            &["ir"],
            vec![
                ModuleDescriptor::bare("account", "missing/account").with_depends(["ir"]),
                ModuleDescriptor::bare("sale", "missing/sale").with_depends(["account"]),
            ],
        );
        let requested = ["sale".to_string()].into_iter().collect();
        ModuleDependencies::build_order(&requested, &registry).unwrap()
    }

    fn install_all() -> Directives {
        Directives::new().install(["ir", "account", "sale"])
    }

    #[test]
    fn test_one_commit_per_module_plus_final() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path()).unwrap();
        let collaborators = collaborators("");
        let loader = ModuleLoader::new(&collaborators, "locale", "po");
        let mut txn = storage.begin(ROOT_USER);

        let report = loader
            .load_module_graph(&graph(), &mut txn, &BTreeMap::new(), &install_all(), &[])
            .unwrap();

        assert_eq!(report.installed, vec!["ir", "account", "sale"]);
        // markers, three checkpoints, final
        assert_eq!(txn.commit_count(), 5);
        assert!(!txn.has_pending());
    }

    #[test]
    fn test_failure_keeps_earlier_checkpoints() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path()).unwrap();
        let collaborators = collaborators("sale");
        let loader = ModuleLoader::new(&collaborators, "locale", "po");
        let mut txn = storage.begin(ROOT_USER);

        let err = loader
            .load_module_graph(&graph(), &mut txn, &BTreeMap::new(), &install_all(), &[])
            .unwrap_err();
        assert_eq!(err.module(), Some("sale"));
        assert!(!txn.has_pending());

        let fresh = storage.begin(ROOT_USER);
        let states: Vec<(String, InstallState)> = ModuleStore::all(&fresh)
            .unwrap()
            .into_iter()
            .map(|record| (record.name, record.state))
            .collect();
        assert_eq!(
            states,
            vec![
                ("account".to_string(), InstallState::Installed),
                ("ir".to_string(), InstallState::Installed),
                ("sale".to_string(), InstallState::ToInstall),
            ]
        );
    }

    #[test]
    fn test_upgrade_markers_survive_a_failed_dependent() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path()).unwrap();
        let installed: BTreeMap<String, InstallState> = ["ir", "account", "sale"]
            .iter()
            .map(|name| (name.to_string(), InstallState::Installed))
            .collect();
        {
            let mut txn = storage.begin(ROOT_USER);
            for name in installed.keys() {
                ModuleStore::upsert_state(&mut txn, name, InstallState::Installed).unwrap();
            }
            txn.commit().unwrap();
        }

        let collaborators = collaborators("sale");
        let loader = ModuleLoader::new(&collaborators, "locale", "po");
        let mut txn = storage.begin(ROOT_USER);
        let directives = Directives::new().update(["account"]);
        assert!(loader
            .load_module_graph(&graph(), &mut txn, &installed, &directives, &[])
            .is_err());

        let fresh = storage.begin(ROOT_USER);
        let states = ModuleStore::states_of(&fresh, installed.keys()).unwrap();
        assert_eq!(states["ir"], InstallState::Installed);
        assert_eq!(states["account"], InstallState::Installed);
        assert_eq!(states["sale"], InstallState::ToUpgrade);
    }

    #[test]
    fn test_installed_modules_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path()).unwrap();
        let collaborators = collaborators("");
        let loader = ModuleLoader::new(&collaborators, "locale", "po");
        let mut txn = storage.begin(ROOT_USER);
        let persisted: BTreeMap<String, InstallState> = [
            ("ir".to_string(), InstallState::Installed),
            ("account".to_string(), InstallState::Installed),
        ]
        .into_iter()
        .collect();

        let report = loader
            .load_module_graph(&graph(), &mut txn, &persisted, &install_all(), &[])
            .unwrap();
        assert_eq!(report.installed, vec!["sale"]);
    }
}
