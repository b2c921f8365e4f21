//! Module manager
//!
//! Composition root of the installer: picks the module set of a run from the
//! persisted module table and the directives, resolves it against the
//! registry, loads the result and finally runs the removal pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::LoaderConfig;
use crate::module::loader::{Collaborators, LoadReport, ModuleLoader};
use crate::module::plugins::PluginTable;
use crate::module::registry::{
    DependencyGraph, ModuleDependencies, ModuleRegistry, SharedRegistry,
};
use crate::module::state::{Directives, InstallState};
use crate::module::traits::{LoadError, ModuleError};
use crate::storage::{ModuleRecord, ModuleStore, Storage, Transaction, ROOT_USER};

/// Persisted states whose modules take part in every run
const TRACKED_STATES: [InstallState; 4] = [
    InstallState::Installed,
    InstallState::ToInstall,
    InstallState::ToUpgrade,
    InstallState::ToRemove,
];

/// Module manager coordinates registry, storage and collaborators
pub struct ModuleManager {
    registry: SharedRegistry,
    storage: Arc<Storage>,
    collaborators: Collaborators,
    plugins: PluginTable,
    /// Languages imported when the directives name none
    default_languages: Vec<String>,
}

impl ModuleManager {
    /// Create a new module manager
    pub fn new(registry: SharedRegistry, storage: Arc<Storage>, collaborators: Collaborators) -> Self {
        Self {
            registry,
            storage,
            collaborators,
            plugins: PluginTable::new(),
            default_languages: Vec::new(),
        }
    }

    /// Open storage and scan the registry described by `config`
    pub fn from_config(
        config: &LoaderConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ModuleError> {
        config.validate()?;
        let storage = match config.storage.database_backend.backend() {
            Some(backend) => Storage::with_backend(&config.storage.data_dir, backend)?,
            None => Storage::new(&config.storage.data_dir)?,
        };
        let registry = SharedRegistry::new(ModuleRegistry::from_config(&config.modules));
        registry.rescan()?;
        Ok(Self::new(registry, Arc::new(storage), collaborators)
            .with_default_languages(config.languages()))
    }

    pub fn with_plugins(mut self, plugins: PluginTable) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_default_languages(mut self, languages: Vec<String>) -> Self {
        self.default_languages = languages;
        self
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Resolve `requested` into an activation order
    pub fn resolve(&self, requested: &BTreeSet<String>) -> Result<DependencyGraph, ModuleError> {
        let graph = self
            .registry
            .read(|registry| ModuleDependencies::build_order(requested, registry))??;
        Ok(graph)
    }

    /// Bring the installation in line with `directives`.
    ///
    /// Without an `outer` transaction the run opens its own as the root
    /// user. With one, it runs in an independent nested scope (root user,
    /// empty context), so the caller's pending writes are left alone.
    pub fn load_modules(
        &self,
        outer: Option<&Transaction>,
        directives: &Directives,
    ) -> Result<LoadReport, ModuleError> {
        let mut txn = match outer {
            Some(outer) => outer.nested(),
            None => self.storage.begin(ROOT_USER),
        };

        let result = self.run(&mut txn, directives);
        if result.is_err() {
            txn.rollback();
        }
        result
    }

    fn run(&self, txn: &mut Transaction, directives: &Directives) -> Result<LoadReport, ModuleError> {
        let requested = self.module_list(txn, directives)?;
        let graph = self.resolve(&requested)?;
        info!("Loading {} modules", graph.len());

        let persisted =
            ModuleStore::states_of(txn, graph.names().iter()).map_err(LoadError::Storage)?;
        let languages = if directives.languages.is_empty() {
            self.default_languages.clone()
        } else {
            directives.languages.clone()
        };

        let (locale_dir, locale_extension) = self.registry.read(|registry| {
            (
                registry.locale_dir().to_string(),
                registry.locale_extension().to_string(),
            )
        })?;
        let loader = ModuleLoader::new(&self.collaborators, locale_dir, locale_extension);

        let mut report =
            loader.load_module_graph(&graph, txn, &persisted, directives, &languages)?;

        let scheduled = ModuleStore::names_in_states(txn, &[InstallState::ToRemove])
            .map_err(LoadError::Storage)?;
        if !scheduled.is_empty() {
            report.removed = loader.remove_modules(txn)?;
        }

        txn.commit().map_err(LoadError::Storage)?;
        info!(
            "Load complete: {} installed, {} removed",
            report.installed.len(),
            report.removed.len()
        );
        Ok(report)
    }

    /// Modules taking part in a run: every tracked persisted module plus the
    /// modules named by the directives.
    fn module_list(
        &self,
        txn: &Transaction,
        directives: &Directives,
    ) -> Result<BTreeSet<String>, ModuleError> {
        let mut requested: BTreeSet<String> = ModuleStore::names_in_states(txn, &TRACKED_STATES)
            .map_err(LoadError::Storage)?
            .into_iter()
            .collect();
        requested.extend(directives.install.iter().cloned());
        requested.extend(directives.update.iter().cloned());
        if directives.install_all {
            requested.extend(self.registry.read(ModuleDependencies::expand_all)?);
        }
        Ok(requested)
    }

    /// Run every module's registration capability in dependency order.
    ///
    /// Returns the activated modules. A non built-in module whose directory
    /// is gone is an error; a module without a registration is activated
    /// as is.
    pub fn register_classes(&self) -> Result<Vec<String>, ModuleError> {
        let (names, builtins) = self
            .registry
            .read(|registry| (registry.names(), registry.builtin_names()))?;
        let graph = self.resolve(&names.into_iter().collect())?;

        let mut activated = Vec::with_capacity(graph.len());
        for descriptor in graph.ordered() {
            let module = descriptor.name.as_str();
            info!("{}:registering classes", module);
            if !builtins.iter().any(|b| b == module) && !descriptor.path.is_dir() {
                return Err(ModuleError::OperationError(format!(
                    "Couldn't find module {} in {}",
                    module,
                    descriptor.path.display()
                )));
            }
            if let Some(registration) = self.plugins.get(module) {
                registration.register(module).map_err(|e| {
                    ModuleError::OperationError(format!(
                        "Registration of module {} failed: {}",
                        module, e
                    ))
                })?;
            }
            activated.push(module.to_string());
        }
        Ok(activated)
    }

    /// Mark installed modules `to_remove`; the next run uninstalls them.
    ///
    /// Returns the modules actually scheduled.
    pub fn schedule_removal<I, S>(&self, modules: I) -> Result<Vec<String>, ModuleError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let builtins = self.registry.read(|registry| registry.builtin_names())?;
        let mut txn = self.storage.begin(ROOT_USER);
        let mut scheduled = Vec::new();
        for module in modules {
            let module = module.as_ref();
            if builtins.iter().any(|b| b == module) {
                warn!("Refusing to remove built-in module {}", module);
                continue;
            }
            match ModuleStore::get(&txn, module).map_err(LoadError::Storage)? {
                Some(record) if record.state == InstallState::Installed => {
                    ModuleStore::set_state(&mut txn, module, InstallState::ToRemove)
                        .map_err(LoadError::Storage)?;
                    scheduled.push(module.to_string());
                }
                Some(record) => {
                    warn!("Module {} is {}, not scheduling removal", module, record.state);
                }
                None => warn!("Module {} is not installed", module),
            }
        }
        txn.commit().map_err(LoadError::Storage)?;
        Ok(scheduled)
    }

    /// Persisted module table, ordered by name
    pub fn module_states(&self) -> Result<Vec<ModuleRecord>, ModuleError> {
        let txn = self.storage.begin(ROOT_USER);
        Ok(ModuleStore::all(&txn).map_err(LoadError::Storage)?)
    }
}
