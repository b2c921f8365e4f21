//! modinstall command-line tool
//!
//! Inspects a module tree and its installation database: activation order,
//! dependency levels, persisted states. Can also schedule removals and run
//! the development watcher.
//!
//! Usage:
//!   modinstall --config modinstall.toml order sale stock
//!   modinstall status
//!   modinstall schedule-removal sale

use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

use modinstall::module::traits::{
    ClassPool, EntityStore, FixtureImporter, ImportScope, RecordRef, SchemaEntity,
    TranslationImporter,
};
use modinstall::module::{
    Collaborators, ModuleDependencies, ModuleManager, ModuleRegistry, ModuleWatcher,
    SharedRegistry,
};
use modinstall::storage::Transaction;
use modinstall::utils::{create_shutdown_receiver, init_logging_from_config};
use modinstall::LoaderConfig;

#[derive(Parser, Debug)]
#[command(name = "modinstall", version, about = "Module installation engine")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the activation order of the given modules
    Order {
        modules: Vec<String>,
    },
    /// Print dependency levels, shallowest first
    Levels {
        modules: Vec<String>,
        /// Print the dependency tree instead
        #[arg(long)]
        tree: bool,
    },
    /// Print the persisted state of every known module
    Status,
    /// Mark installed modules for removal on the next run
    ScheduleRemoval {
        #[arg(required = true)]
        modules: Vec<String>,
    },
    /// List available modules and rejected manifests
    Scan,
    /// Poll the module tree and report changes until interrupted
    /// (requires `watcher.enabled`)
    Watch,
}

/// Stand-in collaborators: the tool never loads modules itself
struct Detached;

impl ClassPool for Detached {
    fn setup(&self, module: &str) -> anyhow::Result<Vec<Arc<dyn SchemaEntity>>> {
        anyhow::bail!("no class pool attached, cannot set up {}", module)
    }
}

impl FixtureImporter for Detached {
    fn parse(
        &self,
        scope: &ImportScope,
        _txn: &mut Transaction,
        _stream: &mut dyn Read,
    ) -> anyhow::Result<Vec<RecordRef>> {
        anyhow::bail!("no fixture importer attached, cannot load {}", scope.module)
    }
}

impl TranslationImporter for Detached {
    fn import_catalog(
        &self,
        _language: &str,
        module: &str,
        _file: &Path,
        _txn: &mut Transaction,
    ) -> anyhow::Result<()> {
        anyhow::bail!("no translation importer attached, cannot load {}", module)
    }
}

impl EntityStore for Detached {
    fn delete(&self, _txn: &mut Transaction, entity: &str, _ids: &[u64]) -> anyhow::Result<()> {
        anyhow::bail!("no entity store attached, cannot delete from {}", entity)
    }

    fn rebuild_history(&self, _txn: &mut Transaction, entity: &str) -> anyhow::Result<()> {
        anyhow::bail!("no entity store attached, cannot rebuild {}", entity)
    }
}

fn detached() -> Collaborators {
    let detached = Arc::new(Detached);
    Collaborators {
        pool: detached.clone(),
        fixtures: detached.clone(),
        translations: detached.clone(),
        entities: detached,
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<LoaderConfig> {
    match path {
        Some(path) => LoaderConfig::from_file(path),
        None => {
            let config = LoaderConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn scanned_registry(config: &LoaderConfig) -> anyhow::Result<SharedRegistry> {
    let registry = SharedRegistry::new(ModuleRegistry::from_config(&config.modules));
    registry.rescan()?;
    Ok(registry)
}

fn requested(modules: Vec<String>) -> BTreeSet<String> {
    modules.into_iter().collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    init_logging_from_config(config.logging.as_ref());

    match args.command {
        Command::Order { modules } => {
            let registry = scanned_registry(&config)?;
            let graph = registry
                .read(|registry| ModuleDependencies::build_order(&requested(modules), registry))??;
            for name in graph.names() {
                println!("{}", name);
            }
        }
        Command::Levels { modules, tree } => {
            let registry = scanned_registry(&config)?;
            let graph = registry
                .read(|registry| ModuleDependencies::build_order(&requested(modules), registry))??;
            if tree {
                print!("{}", graph.pprint());
            } else {
                for (depth, level) in graph.levels().iter().enumerate() {
                    println!("{}: {}", depth, level.join(" "));
                }
            }
        }
        Command::Status => {
            let manager = ModuleManager::from_config(&config, detached())?;
            for record in manager.module_states()? {
                println!("{:<32} {}", record.name, record.state);
            }
        }
        Command::ScheduleRemoval { modules } => {
            let manager = ModuleManager::from_config(&config, detached())?;
            let scheduled = manager.schedule_removal(&modules)?;
            manager.storage().flush()?;
            if scheduled.is_empty() {
                println!("Nothing scheduled");
            }
            for name in scheduled {
                println!("{} -> to_remove", name);
            }
        }
        Command::Scan => {
            let registry = scanned_registry(&config)?;
            let (catalog, rejected) = registry.read(|registry| {
                let catalog: Vec<(String, PathBuf)> = registry
                    .catalog()
                    .values()
                    .map(|descriptor| (descriptor.name.clone(), descriptor.path.clone()))
                    .collect();
                let rejected: Vec<String> =
                    registry.rejected().values().map(|e| e.to_string()).collect();
                (catalog, rejected)
            })?;
            for (name, path) in catalog {
                println!("{:<32} {}", name, path.display());
            }
            for error in rejected {
                eprintln!("rejected: {}", error);
            }
        }
        Command::Watch => {
            let Some(interval) = config.watcher.poll_interval() else {
                anyhow::bail!("watcher is disabled, set watcher.enabled = true in the configuration");
            };
            let registry = scanned_registry(&config)?;
            let watcher = Arc::new(ModuleWatcher::new(registry));
            let files: Vec<PathBuf> = args.config.into_iter().collect();

            let (notify_tx, mut notify_rx) = mpsc::channel(8);
            let shutdown = create_shutdown_receiver();
            let task = {
                let watcher = Arc::clone(&watcher);
                tokio::spawn(async move {
                    watcher.watch(files, interval, notify_tx, shutdown).await;
                })
            };

            while notify_rx.recv().await.is_some() {
                info!("Module tree changed, reload required");
            }
            if let Err(e) = task.await {
                error!("Watcher task failed: {}", e);
            }
        }
    }

    Ok(())
}
