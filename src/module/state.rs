//! Installation state tracking
//!
//! Derives the working lifecycle state of every module in a resolved graph
//! from the persisted module table and the run's install/update directives,
//! and propagates target states to dependents.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::module::registry::dependencies::DependencyGraph;

/// Sentinel selecting every available module
pub const ALL_MODULES: &str = "all";

/// Pseudo-module never selected by the `all` sentinel
pub const TESTS_MODULE: &str = "tests";

/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallState {
    NotInstalled,
    ToInstall,
    ToUpgrade,
    Installed,
    ToRemove,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallState::NotInstalled => "not_installed",
            InstallState::ToInstall => "to_install",
            InstallState::ToUpgrade => "to_upgrade",
            InstallState::Installed => "installed",
            InstallState::ToRemove => "to_remove",
        }
    }

    /// `to_install` or `to_upgrade`: the module has work pending
    pub fn is_pending(&self) -> bool {
        matches!(self, InstallState::ToInstall | InstallState::ToUpgrade)
    }

    /// Marker a module becomes when it is selected as a target
    pub fn target_marker(&self) -> InstallState {
        match self {
            InstallState::Installed => InstallState::ToUpgrade,
            InstallState::ToUpgrade => InstallState::ToUpgrade,
            _ => InstallState::ToInstall,
        }
    }
}

impl fmt::Display for InstallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_installed" | "uninstalled" => Ok(InstallState::NotInstalled),
            "to_install" => Ok(InstallState::ToInstall),
            "to_upgrade" => Ok(InstallState::ToUpgrade),
            "installed" => Ok(InstallState::Installed),
            "to_remove" => Ok(InstallState::ToRemove),
            other => Err(format!("unknown install state: {}", other)),
        }
    }
}

/// What a run has been asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directives {
    /// Select every available module (except `tests`)
    #[serde(default)]
    pub install_all: bool,
    /// Modules to install
    #[serde(default)]
    pub install: BTreeSet<String>,
    /// Modules to upgrade
    #[serde(default)]
    pub update: BTreeSet<String>,
    /// Languages whose translation catalogs are imported
    #[serde(default)]
    pub languages: Vec<String>,
}

impl Directives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if name == ALL_MODULES {
                self.install_all = true;
            } else {
                self.install.insert(name);
            }
        }
        self
    }

    pub fn update<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            let name = name.into();
            if name == ALL_MODULES {
                self.install_all = true;
            } else {
                self.update.insert(name);
            }
        }
        self
    }

    pub fn install_all(mut self) -> Self {
        self.install_all = true;
        self
    }

    pub fn languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.languages = languages.into_iter().map(Into::into).collect();
        self
    }

    /// Whether the run asks for any change at all
    pub fn is_update(&self) -> bool {
        self.install_all || !self.install.is_empty() || !self.update.is_empty()
    }

    /// Whether `module` is selected by these directives, given its
    /// persisted state.
    ///
    /// `update` always selects. `install` and `install_all` only select
    /// modules that are not installed yet, so repeating an install run is a
    /// no-op.
    pub fn is_target(&self, module: &str, persisted: Option<InstallState>) -> bool {
        if self.update.contains(module) {
            return true;
        }
        let already_installed = persisted == Some(InstallState::Installed);
        if self.install.contains(module) {
            return !already_installed;
        }
        self.install_all && module != TESTS_MODULE && !already_installed
    }
}

/// Derives and propagates working install states
pub struct StateTracker;

impl StateTracker {
    /// Compute the working state of every module in `graph`
    pub fn compute_actions(
        persisted: &BTreeMap<String, InstallState>,
        graph: &DependencyGraph,
        directives: &Directives,
    ) -> BTreeMap<String, InstallState> {
        let mut states: BTreeMap<String, InstallState> = BTreeMap::new();
        for descriptor in graph.ordered() {
            let name = descriptor.name.clone();
            let current = persisted.get(&name).copied();
            let state = if directives.is_target(&name, current) {
                current.unwrap_or(InstallState::NotInstalled).target_marker()
            } else {
                current.unwrap_or(InstallState::NotInstalled)
            };
            states.insert(name, state);
        }

        // Pull in missing dependencies and push markers to dependents until
        // nothing moves. States only ever advance, so this terminates.
        loop {
            let mut moved = Self::require_dependencies(graph, &mut states);
            for descriptor in graph.ordered() {
                let state = states
                    .get(&descriptor.name)
                    .copied()
                    .unwrap_or(InstallState::NotInstalled);
                if state.is_pending() {
                    let changed = Self::propagate(graph, &descriptor.name, state, &mut states);
                    moved |= !changed.is_empty();
                }
            }
            if !moved {
                break;
            }
        }
        states
    }

    /// Mark `to_install` every uninstalled dependency of a pending module,
    /// built-ins included. Returns whether anything changed.
    fn require_dependencies(
        graph: &DependencyGraph,
        states: &mut BTreeMap<String, InstallState>,
    ) -> bool {
        let pending: Vec<String> = states
            .iter()
            .filter(|(_, state)| state.is_pending())
            .map(|(name, _)| name.clone())
            .collect();
        let mut moved = false;
        for name in pending {
            for dependency in graph.dependencies_of(&name) {
                let current = states.get(&dependency).copied();
                if matches!(current, None | Some(InstallState::NotInstalled)) {
                    debug!("{}: to_install (required by {})", dependency, name);
                    states.insert(dependency, InstallState::ToInstall);
                    moved = true;
                }
            }
        }
        moved
    }

    /// Push `state` (a pending marker) onto every transitive dependent of
    /// `module`.
    ///
    /// Installed dependents become `to_upgrade`, uninstalled ones inherit
    /// the marker. Dependents already pending keep their marker and those
    /// scheduled for removal stay scheduled.
    pub fn propagate(
        graph: &DependencyGraph,
        module: &str,
        state: InstallState,
        states: &mut BTreeMap<String, InstallState>,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        if !state.is_pending() {
            return changed;
        }
        for dependent in graph.dependents_of(module) {
            let current = states
                .get(&dependent)
                .copied()
                .unwrap_or(InstallState::NotInstalled);
            let next = match current {
                InstallState::Installed => InstallState::ToUpgrade,
                InstallState::NotInstalled => state,
                InstallState::ToInstall | InstallState::ToUpgrade | InstallState::ToRemove => {
                    current
                }
            };
            if next != current {
                debug!("{}: {} -> {} (dependency {})", dependent, current, next, module);
                states.insert(dependent.clone(), next);
                changed.push(dependent);
            }
        }
        changed
    }
}
