//! Static plugin table
//!
//! Modules contribute their classes through a `ModuleRegistration` value
//! registered here under the module's name, instead of being loaded as code
//! at runtime.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::module::traits::ModuleRegistration;

/// Module name -> registration capability
#[derive(Clone, Default)]
pub struct PluginTable {
    entries: BTreeMap<String, Arc<dyn ModuleRegistration>>,
}

impl PluginTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the capability of `module`
    pub fn register(&mut self, module: impl Into<String>, registration: Arc<dyn ModuleRegistration>) {
        self.entries.insert(module.into(), registration);
    }

    pub fn with(mut self, module: impl Into<String>, registration: Arc<dyn ModuleRegistration>) -> Self {
        self.register(module, registration);
        self
    }

    pub fn get(&self, module: &str) -> Option<&Arc<dyn ModuleRegistration>> {
        self.entries.get(module)
    }

    pub fn contains(&self, module: &str) -> bool {
        self.entries.contains_key(module)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for PluginTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Registration backed by a plain function
pub struct FnRegistration<F>(pub F);

impl<F> ModuleRegistration for FnRegistration<F>
where
    F: Fn(&str) -> anyhow::Result<()> + Send + Sync,
{
    fn register(&self, module: &str) -> anyhow::Result<()> {
        (self.0)(module)
    }
}
