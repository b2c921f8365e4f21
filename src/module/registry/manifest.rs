//! Module manifest parsing
//!
//! Handles parsing `module.toml` manifests into `ModuleDescriptor`s.
//!
//! ```toml
//! [module]
//! depends = """
//! ir
//! res
//! """
//! extras_depend = ["shipping"]
//! xml = """
//! sale.xml
//! configuration.xml
//! """
//! ```
//!
//! List values may be written either as newline-separated strings or as
//! string arrays.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::module::traits::ManifestError;

/// Default manifest file name inside a module directory
pub const MANIFEST_FILE: &str = "module.toml";

/// Default translation directory inside a module directory
pub const LOCALE_DIR: &str = "locale";

/// Default translation catalog extension
pub const LOCALE_EXTENSION: &str = "po";

/// A list of names written as an array or as newline-separated text
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum NameList {
    List(Vec<String>),
    Lines(String),
}

impl Default for NameList {
    fn default() -> Self {
        NameList::List(Vec::new())
    }
}

impl NameList {
    /// Entries in declared order, trimmed, blanks dropped
    pub fn entries(&self) -> Vec<String> {
        let raw: Vec<&str> = match self {
            NameList::List(items) => items.iter().map(|s| s.as_str()).collect(),
            NameList::Lines(text) => text.lines().collect(),
        };
        raw.into_iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// `[module]` section of a manifest
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleSection {
    /// Module version (informational)
    #[serde(default)]
    pub version: Option<String>,
    /// Hard dependencies
    #[serde(default)]
    pub depends: NameList,
    /// Optional dependencies
    #[serde(default)]
    pub extras_depend: NameList,
    /// Fixture data files, relative to the module directory
    #[serde(default)]
    pub xml: NameList,
    /// Any other key/value pair
    #[serde(flatten)]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Module manifest (`module.toml` structure)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModuleManifest {
    #[serde(default)]
    pub module: ModuleSection,
}

impl ModuleManifest {
    /// Parse manifest text; `path` is only used for error reporting
    pub fn parse(contents: &str, path: &Path) -> Result<Self, ManifestError> {
        toml::from_str(contents).map_err(|e| ManifestError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Load manifest from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ManifestError::Unreadable {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::parse(&contents, path)
    }
}

/// Parsed representation of one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Unique module name
    pub name: String,
    /// Module directory
    pub path: PathBuf,
    /// Hard dependencies
    pub depends: BTreeSet<String>,
    /// Dependencies honored only when they are requested too
    pub optional_depends: BTreeSet<String>,
    /// Fixture files in declared order, relative to `path`
    pub data_files: Vec<PathBuf>,
    /// Translation catalogs found under the locale directory
    pub locale_files: BTreeSet<PathBuf>,
    /// Declared version, if any
    pub version: Option<String>,
}

impl ModuleDescriptor {
    /// Descriptor for a module without manifest content (built-ins)
    pub fn bare(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            depends: BTreeSet::new(),
            optional_depends: BTreeSet::new(),
            data_files: Vec::new(),
            locale_files: BTreeSet::new(),
            version: None,
        }
    }

    /// Build a descriptor from a parsed manifest
    pub fn from_manifest(
        name: &str,
        path: &Path,
        manifest: &ModuleManifest,
    ) -> Result<Self, ManifestError> {
        let depends: BTreeSet<String> = manifest.module.depends.entries().into_iter().collect();
        if depends.contains(name) {
            return Err(ManifestError::SelfDependency(name.to_string()));
        }
        let optional_depends = manifest
            .module
            .extras_depend
            .entries()
            .into_iter()
            .filter(|dep| dep != name)
            .collect();
        let data_files = manifest
            .module
            .xml
            .entries()
            .iter()
            .map(|file| {
                relative_path(file).map_err(|message| ManifestError::Malformed {
                    path: path.to_path_buf(),
                    message,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            depends,
            optional_depends,
            data_files,
            locale_files: BTreeSet::new(),
            version: manifest.module.version.clone(),
        })
    }

    /// Read `<path>/<manifest_file>` and build the descriptor
    pub fn load(name: &str, path: &Path, manifest_file: &str) -> Result<Self, ManifestError> {
        let manifest_path = path.join(manifest_file);
        if !manifest_path.is_file() {
            return Err(ManifestError::Missing {
                name: name.to_string(),
                path: path.to_path_buf(),
            });
        }
        let manifest = ModuleManifest::from_file(&manifest_path)?;
        Self::from_manifest(name, path, &manifest)
    }

    pub fn with_depends<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends = depends.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional_depends<I, S>(mut self, depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_depends = depends.into_iter().map(Into::into).collect();
        self
    }

    /// Absolute location of a declared data file
    pub fn data_file_path(&self, file: &Path) -> PathBuf {
        self.path.join(file)
    }
}

/// Turn a `/`-separated manifest path into a platform path inside the
/// module directory
fn relative_path(file: &str) -> Result<PathBuf, String> {
    if file.starts_with('/') {
        return Err(format!("data file {} must be relative to the module", file));
    }
    let mut path = PathBuf::new();
    for part in file.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(format!("data file {} leaves the module directory", file)),
            part => path.push(part),
        }
    }
    if path.as_os_str().is_empty() {
        return Err(format!("empty data file entry {:?}", file));
    }
    Ok(path)
}

/// Translation catalogs physically present under `<module>/<locale_dir>`
///
/// Returns `(language code, file)` pairs sorted by file name.
pub fn locale_catalogs(
    module_dir: &Path,
    locale_dir: &str,
    extension: &str,
) -> std::io::Result<Vec<(String, PathBuf)>> {
    let dir = module_dir.join(locale_dir);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut catalogs = Vec::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        if let Some(code) = path.file_stem().and_then(|s| s.to_str()) {
            catalogs.push((code.to_string(), path.clone()));
        }
    }
    catalogs.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(catalogs)
}
