//! Module discovery
//!
//! Scans module search paths and plugged-in sources, and builds the catalog
//! of available modules. Built-in core modules are always part of the
//! catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::ModulesConfig;
use crate::module::registry::manifest::{
    locale_catalogs, ModuleDescriptor, LOCALE_DIR, LOCALE_EXTENSION, MANIFEST_FILE,
};
use crate::module::state::ALL_MODULES;
use crate::module::traits::{ManifestError, ModuleError, ModuleSource, ResolutionError};
use crate::utils::lock::with_lock;

/// Built-in core module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinModule {
    pub name: String,
    pub path: PathBuf,
}

impl BuiltinModule {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Plugged-in source backed by an explicit `name -> directory` table
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    label: String,
    modules: BTreeMap<String, PathBuf>,
}

impl StaticSource {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            modules: BTreeMap::new(),
        }
    }

    pub fn with_module(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.modules.insert(name.into(), path.into());
        self
    }
}

impl ModuleSource for StaticSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn locate(&self) -> anyhow::Result<Vec<(String, PathBuf)>> {
        Ok(self
            .modules
            .iter()
            .map(|(name, path)| (name.clone(), path.clone()))
            .collect())
    }
}

/// Catalog of every discoverable module
pub struct ModuleRegistry {
    search_paths: Vec<PathBuf>,
    sources: Vec<Box<dyn ModuleSource>>,
    builtins: Vec<BuiltinModule>,
    manifest_file: String,
    locale_dir: String,
    locale_extension: String,
    catalog: BTreeMap<String, ModuleDescriptor>,
    rejected: BTreeMap<String, ManifestError>,
}

impl ModuleRegistry {
    /// Create an empty registry; call `scan` to populate it
    pub fn new(search_paths: Vec<PathBuf>, builtins: Vec<BuiltinModule>) -> Self {
        Self {
            search_paths,
            sources: Vec::new(),
            builtins,
            manifest_file: MANIFEST_FILE.to_string(),
            locale_dir: LOCALE_DIR.to_string(),
            locale_extension: LOCALE_EXTENSION.to_string(),
            catalog: BTreeMap::new(),
            rejected: BTreeMap::new(),
        }
    }

    /// Create a registry from configuration
    pub fn from_config(config: &ModulesConfig) -> Self {
        let builtins = config
            .builtin_modules
            .iter()
            .map(|name| BuiltinModule::new(name.clone(), config.core_root.join(name)))
            .collect();
        let mut registry = Self::new(config.search_paths.clone(), builtins);
        registry.manifest_file = config.manifest_file.clone();
        registry.locale_dir = config.locale_dir.clone();
        registry.locale_extension = config.locale_extension.clone();
        registry
    }

    /// Add a plugged-in module source
    pub fn with_source(mut self, source: Box<dyn ModuleSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_manifest_file(mut self, manifest_file: impl Into<String>) -> Self {
        self.manifest_file = manifest_file.into();
        self
    }

    pub fn with_locale(mut self, dir: impl Into<String>, extension: impl Into<String>) -> Self {
        self.locale_dir = dir.into();
        self.locale_extension = extension.into();
        self
    }

    /// Rebuild the catalog from scratch
    ///
    /// The previous catalog is replaced, never merged.
    pub fn scan(&mut self) -> Result<&BTreeMap<String, ModuleDescriptor>, ModuleError> {
        info!("Scanning modules in {:?}", self.search_paths);

        // name -> directory; later locations override earlier ones
        let mut locations: BTreeMap<String, PathBuf> = BTreeMap::new();
        for search_path in &self.search_paths {
            for (name, path) in scan_directory(search_path)? {
                locations.insert(name, path);
            }
        }
        for source in &self.sources {
            let located = source.locate().map_err(|e| {
                ModuleError::OperationError(format!(
                    "Module source {} failed: {}",
                    source.label(),
                    e
                ))
            })?;
            debug!("Source {} provided {} modules", source.label(), located.len());
            locations.extend(located);
        }

        let mut catalog = BTreeMap::new();
        let mut rejected = BTreeMap::new();

        for (name, path) in locations {
            if name == ALL_MODULES || self.is_builtin(&name) {
                continue;
            }
            match ModuleDescriptor::load(&name, &path, &self.manifest_file) {
                Ok(descriptor) => {
                    catalog.insert(name, self.with_locales(descriptor));
                }
                Err(ManifestError::Missing { .. }) => {
                    debug!("No {} found in {:?}, skipping", self.manifest_file, path);
                }
                Err(e) => {
                    warn!("Failed to parse manifest in {:?}: {}", path, e);
                    rejected.insert(name, e);
                }
            }
        }

        // Built-ins are injected unconditionally; a manifest is optional
        for builtin in &self.builtins {
            let descriptor = match ModuleDescriptor::load(
                &builtin.name,
                &builtin.path,
                &self.manifest_file,
            ) {
                Ok(descriptor) => descriptor,
                Err(ManifestError::Missing { .. }) => {
                    ModuleDescriptor::bare(builtin.name.clone(), builtin.path.clone())
                }
                Err(e) => return Err(e.into()),
            };
            catalog.insert(builtin.name.clone(), self.with_locales(descriptor));
        }

        info!(
            "Discovered {} modules ({} rejected)",
            catalog.len(),
            rejected.len()
        );
        self.catalog = catalog;
        self.rejected = rejected;
        Ok(&self.catalog)
    }

    fn with_locales(&self, mut descriptor: ModuleDescriptor) -> ModuleDescriptor {
        match locale_catalogs(&descriptor.path, &self.locale_dir, &self.locale_extension) {
            Ok(catalogs) => {
                descriptor.locale_files = catalogs.into_iter().map(|(_, path)| path).collect();
            }
            Err(e) => warn!("Cannot list locales of {}: {}", descriptor.name, e),
        }
        descriptor
    }

    /// Descriptor of `name`
    pub fn descriptor(&self, name: &str) -> Result<&ModuleDescriptor, ResolutionError> {
        if let Some(descriptor) = self.catalog.get(name) {
            return Ok(descriptor);
        }
        match self.rejected.get(name) {
            Some(error) => Err(ResolutionError::Manifest(error.clone())),
            None => Err(ResolutionError::ModuleNotFound(name.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.catalog.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalog.contains_key(name)
    }

    pub fn catalog(&self) -> &BTreeMap<String, ModuleDescriptor> {
        &self.catalog
    }

    /// Modules whose manifest could not be used during the last scan
    pub fn rejected(&self) -> &BTreeMap<String, ManifestError> {
        &self.rejected
    }

    /// Module names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.catalog.keys().cloned().collect()
    }

    /// Built-in module names in activation order
    pub fn builtin_names(&self) -> Vec<String> {
        self.builtins.iter().map(|b| b.name.clone()).collect()
    }

    pub fn is_builtin(&self, name: &str) -> bool {
        self.builtins.iter().any(|b| b.name == name)
    }

    pub fn manifest_file(&self) -> &str {
        &self.manifest_file
    }

    pub fn locale_dir(&self) -> &str {
        &self.locale_dir
    }

    pub fn locale_extension(&self) -> &str {
        &self.locale_extension
    }

    /// Insert a descriptor directly (used for in-memory catalogs)
    pub fn insert(&mut self, descriptor: ModuleDescriptor) {
        self.rejected.remove(&descriptor.name);
        self.catalog.insert(descriptor.name.clone(), descriptor);
    }

    /// Build an in-memory registry from descriptors, without touching disk
    pub fn from_descriptors<I>(builtins: &[&str], descriptors: I) -> Self
    where
        I: IntoIterator<Item = ModuleDescriptor>,
    {
        let builtin_modules = builtins
            .iter()
            .map(|name| BuiltinModule::new(*name, PathBuf::from(name)))
            .collect();
        let mut registry = Self::new(Vec::new(), builtin_modules);
        for descriptor in descriptors {
            registry.insert(descriptor);
        }
        for name in builtins {
            if !registry.contains(name) {
                registry.insert(ModuleDescriptor::bare(*name, PathBuf::from(name)));
            }
        }
        registry
    }
}

/// Non-hidden subdirectories of `dir` as `(name, path)`
fn scan_directory(dir: &Path) -> Result<Vec<(String, PathBuf)>, ModuleError> {
    if !dir.is_dir() {
        debug!("Module search path {:?} does not exist, skipping", dir);
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(dir).map_err(|e| {
        ModuleError::OperationError(format!("Failed to read modules directory {:?}: {}", dir, e))
    })?;

    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            ModuleError::OperationError(format!("Failed to read directory entry: {}", e))
        })?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) if !name.starts_with('.') => name.to_string(),
            _ => continue,
        };
        found.push((name, path));
    }
    found.sort();
    Ok(found)
}

/// Process-wide registry shared with the development watcher
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<Mutex<ModuleRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(registry)),
        }
    }

    /// Re-scan under the lock; returns the number of catalogued modules
    pub fn rescan(&self) -> Result<usize, ModuleError> {
        with_lock(&self.inner, |registry| {
            registry.scan().map(|catalog| catalog.len())
        })
        .map_err(|_| ModuleError::RegistryPoisoned)?
    }

    /// Run `f` with the registry locked
    pub fn read<R>(&self, f: impl FnOnce(&ModuleRegistry) -> R) -> Result<R, ModuleError> {
        with_lock(&self.inner, |registry| f(registry)).map_err(|_| ModuleError::RegistryPoisoned)
    }

    /// Sorted module names
    pub fn names(&self) -> Result<Vec<String>, ModuleError> {
        self.read(|registry| registry.names())
    }
}
