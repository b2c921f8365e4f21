//! Configuration management for the module installer
//!
//! Handles configuration loading (TOML or JSON) and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::module::registry::manifest::{LOCALE_DIR, LOCALE_EXTENSION, MANIFEST_FILE};
use crate::storage::database::DatabaseBackend;

/// Module discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModulesConfig {
    /// Directories whose subdirectories are modules
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,

    /// Directory holding the built-in core modules
    #[serde(default = "default_core_root")]
    pub core_root: PathBuf,

    /// Built-in modules, in activation order
    #[serde(default = "default_builtin_modules")]
    pub builtin_modules: Vec<String>,

    /// Manifest file name inside a module directory
    #[serde(default = "default_manifest_file")]
    pub manifest_file: String,

    /// Translation directory inside a module directory
    #[serde(default = "default_locale_dir")]
    pub locale_dir: String,

    /// Translation catalog file extension
    #[serde(default = "default_locale_extension")]
    pub locale_extension: String,
}

fn default_search_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("modules")]
}

fn default_core_root() -> PathBuf {
    PathBuf::from("core")
}

fn default_builtin_modules() -> Vec<String> {
    vec!["ir".to_string(), "res".to_string()]
}

fn default_manifest_file() -> String {
    MANIFEST_FILE.to_string()
}

fn default_locale_dir() -> String {
    LOCALE_DIR.to_string()
}

fn default_locale_extension() -> String {
    LOCALE_EXTENSION.to_string()
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            search_paths: default_search_paths(),
            core_root: default_core_root(),
            builtin_modules: default_builtin_modules(),
            manifest_file: default_manifest_file(),
            locale_dir: default_locale_dir(),
            locale_extension: default_locale_extension(),
        }
    }
}

/// Database backend configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackendConfig {
    /// Use sled database
    Sled,
    /// Use redb database (default)
    Redb,
    /// Pick whichever backend is compiled in, redb first
    Auto,
}

impl DatabaseBackendConfig {
    /// Concrete backend, or `None` for automatic selection with fallback
    pub fn backend(&self) -> Option<DatabaseBackend> {
        match self {
            DatabaseBackendConfig::Sled => Some(DatabaseBackend::Sled),
            DatabaseBackendConfig::Redb => Some(DatabaseBackend::Redb),
            DatabaseBackendConfig::Auto => None,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Database backend selection
    #[serde(default = "default_database_backend")]
    pub database_backend: DatabaseBackendConfig,

    /// Storage path
    #[serde(default = "default_storage_path")]
    pub data_dir: PathBuf,
}

fn default_database_backend() -> DatabaseBackendConfig {
    DatabaseBackendConfig::Auto
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_backend: default_database_backend(),
            data_dir: default_storage_path(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `modinstall=debug`. `RUST_LOG` wins.
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON lines (requires the `json-logging` feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Development watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatcherConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Poll interval in milliseconds
    #[serde(default = "default_watch_interval_ms")]
    pub interval_ms: u64,
}

fn default_watch_interval_ms() -> u64 {
    1000
}

impl WatcherConfig {
    /// Poll interval, or `None` when the watcher is switched off
    pub fn poll_interval(&self) -> Option<Duration> {
        self.enabled.then(|| Duration::from_millis(self.interval_ms))
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_watch_interval_ms(),
        }
    }
}

/// Installer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    /// Default translation language, imported on every run
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub modules: ModulesConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: Option<LoggingConfig>,

    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl LoaderConfig {
    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoaderConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoaderConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Load by extension: `.json` is JSON, anything else TOML
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_file(path)?,
            _ => Self::from_toml_file(path)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_toml_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Languages imported by default
    pub fn languages(&self) -> Vec<String> {
        self.language.iter().cloned().collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.modules.builtin_modules.is_empty() {
            return Err(anyhow::anyhow!(
                "modules.builtin_modules must name at least one core module"
            ));
        }
        if self.modules.manifest_file.trim().is_empty() {
            return Err(anyhow::anyhow!("modules.manifest_file must not be empty"));
        }
        if self.modules.locale_extension.trim().is_empty() {
            return Err(anyhow::anyhow!("modules.locale_extension must not be empty"));
        }
        if self.watcher.interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "watcher.interval_ms must be greater than 0"
            ));
        }
        Ok(())
    }
}
