//! Development watcher
//!
//! Polls module files for changes so a development server can reload. A
//! reload is refused while any module manifest fails to parse; errors are
//! logged and never escalated.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::module::registry::SharedRegistry;
use crate::module::traits::WatcherError;
use crate::utils::{log_error, with_default, with_lock};

/// Tracks modification times of module files
pub struct ModuleWatcher {
    registry: SharedRegistry,
    times: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl ModuleWatcher {
    pub fn new(registry: SharedRegistry) -> Self {
        Self {
            registry,
            times: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `path` changed since it was last seen.
    ///
    /// The first sighting of a file only records it. A known file that
    /// disappeared counts as changed. Unreadable metadata counts as changed.
    pub fn modified(&self, path: &Path) -> bool {
        let outcome = with_lock(&self.times, |times| {
            if !path.is_file() {
                return times.remove(path).is_some();
            }
            let mtime = match std::fs::metadata(path).and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    debug!("Cannot stat {:?}: {}", path, e);
                    return true;
                }
            };
            match times.insert(path.to_path_buf(), mtime) {
                Some(previous) => previous != mtime,
                None => false,
            }
        });
        // A poisoned map cannot tell us anything; report no change
        with_default(|| outcome, false, "Watcher state unavailable")
    }

    /// Whether anything relevant changed since the previous check.
    ///
    /// Rescans the registry, checks `files` and every file below each module
    /// directory, and treats a change in the set of available modules as a
    /// modification. Returns `false` when the registry cannot be rescanned
    /// or when a manifest is broken.
    pub fn check(&self, files: &[PathBuf]) -> bool {
        let previous: BTreeSet<String> = with_default(
            || self.registry.names(),
            Vec::new(),
            "Cannot read module catalog",
        )
        .into_iter()
        .collect();

        if let Err(e) = self.registry.rescan() {
            let error = WatcherError::Rescan(e.to_string());
            warn!("{}", error);
            return false;
        }

        let mut modified = false;
        for file in files {
            if self.modified(file) {
                debug!("Changed: {:?}", file);
                modified = true;
            }
        }

        let module_dirs: Vec<PathBuf> = log_error(
            || {
                self.registry.read(|registry| {
                    registry
                        .catalog()
                        .values()
                        .map(|descriptor| descriptor.path.clone())
                        .collect()
                })
            },
            "Cannot list module directories",
        )
        .unwrap_or_default();

        for dir in module_dirs {
            for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() && self.modified(entry.path()) {
                    debug!("Changed: {:?}", entry.path());
                    modified = true;
                }
            }
        }

        let current: BTreeSet<String> =
            with_default(|| self.registry.names(), Vec::new(), "Cannot read module catalog")
                .into_iter()
                .collect();
        if !previous.is_empty() && previous != current {
            debug!(
                "Module set changed: {:?}",
                previous.symmetric_difference(&current).collect::<Vec<_>>()
            );
            modified = true;
        }

        if modified {
            let broken = log_error(
                || {
                    self.registry.read(|registry| {
                        registry
                            .rejected()
                            .iter()
                            .next()
                            .map(|(name, error)| (name.clone(), error.to_string()))
                    })
                },
                "Cannot inspect rejected manifests",
            )
            .flatten();
            if let Some((module, reason)) = broken {
                let error = WatcherError::NotReloadable { module, reason };
                warn!("{}, not reloading", error);
                return false;
            }
        }

        modified
    }

    /// Poll `check` every `interval` and send a notification on each change
    /// until `shutdown` flips to `true` or the receiver goes away.
    ///
    /// `check` walks the tree and stats files, so each poll runs on the
    /// blocking thread pool.
    pub async fn watch(
        self: Arc<Self>,
        files: Vec<PathBuf>,
        interval: Duration,
        notify: mpsc::Sender<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Watching modules every {:?}", interval);
        let files: Arc<[PathBuf]> = files.into();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let watcher = Arc::clone(&self);
                    let watched = Arc::clone(&files);
                    let changed = tokio::task::spawn_blocking(move || watcher.check(&watched))
                        .await
                        .unwrap_or_else(|e| {
                            warn!("Watcher poll failed: {}", e);
                            false
                        });
                    if changed && notify.send(()).await.is_err() {
                        debug!("Change receiver dropped, stopping watcher");
                        break;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Module watcher stopped");
    }
}
