//! End-to-end tests of install, update and removal runs

mod common;

use common::*;
use std::fs;
use std::sync::Arc;

use modinstall::module::plugins::{FnRegistration, PluginTable};
use modinstall::module::traits::{LoadError, LoadStage, ModuleError, RecordRef, ResolutionError};
use modinstall::module::{Directives, InstallState, ModuleManager};
use modinstall::storage::database::SEQUENCES_TREE;
use modinstall::storage::{ModelDataStore, ROOT_USER};

const SALES_DATA: &str = "create sale.order 1\ncreate sale.order 2\ncreate sale.line 3\n";

/// ir <- base <- sales
fn sales_workspace() -> Workspace {
    let ws = Workspace::new();
    ws.module("base", &["ir"], &[("base.data", "create res.group 1\n")]);
    ws.module("sales", &["base"], &[("sales.data", SALES_DATA)]);
    ws
}

fn state_of(manager: &ModuleManager, module: &str) -> Option<InstallState> {
    manager
        .module_states()
        .unwrap()
        .into_iter()
        .find(|record| record.name == module)
        .map(|record| record.state)
}

#[test]
fn test_install_pulls_in_dependencies_in_order() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let report = manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap();

    assert_eq!(report.installed, vec!["ir", "base", "sales"]);
    assert_eq!(
        journal.matching("setup:"),
        vec!["setup:ir", "setup:base", "setup:sales"]
    );
    assert_eq!(
        journal.matching("fixture:"),
        vec!["fixture:base:to_install", "fixture:sales:to_install"]
    );
    for module in ["ir", "base", "sales"] {
        assert_eq!(state_of(&manager, module), Some(InstallState::Installed));
    }
}

#[test]
fn test_repeated_install_is_noop() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));
    let directives = Directives::new().install(["sales"]);

    manager.load_modules(None, &directives).unwrap();
    journal.clear();

    let report = manager.load_modules(None, &directives).unwrap();
    assert!(report.is_noop());
    assert!(journal.matching("setup:").is_empty());
    assert!(journal.matching("fixture:").is_empty());
}

#[test]
fn test_update_upgrades_dependents() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));
    manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap();
    journal.clear();

    let report = manager
        .load_modules(None, &Directives::new().update(["base"]))
        .unwrap();

    assert_eq!(report.installed, vec!["base", "sales"]);
    assert_eq!(
        journal.matching("fixture:"),
        vec!["fixture:base:to_upgrade", "fixture:sales:to_upgrade"]
    );

    // Re-importing fixtures does not duplicate provenance
    let txn = manager.storage().begin(ROOT_USER);
    assert_eq!(ModelDataStore::for_module(&txn, "sales").unwrap().len(), 3);
}

#[test]
fn test_failure_keeps_committed_modules_and_resumes() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(
        &journal,
        RecordingPool::new(journal.clone()).failing("sales"),
    );
    let directives = Directives::new().install(["sales"]);

    let err = manager.load_modules(None, &directives).unwrap_err();
    match err {
        ModuleError::Load(LoadError::Module { module, stage, .. }) => {
            assert_eq!(module, "sales");
            assert_eq!(stage, LoadStage::Register);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(state_of(&manager, "ir"), Some(InstallState::Installed));
    assert_eq!(state_of(&manager, "base"), Some(InstallState::Installed));
    assert_eq!(state_of(&manager, "sales"), Some(InstallState::ToInstall));

    // Same database, schema fixed
    journal.clear();
    let fixed = ModuleManager::new(
        ws.registry(),
        Arc::clone(manager.storage()),
        collaborators(&journal, RecordingPool::new(journal.clone())),
    );
    let report = fixed.load_modules(None, &directives).unwrap();
    assert_eq!(report.installed, vec!["sales"]);
    assert_eq!(journal.matching("setup:"), vec!["setup:sales"]);
    assert_eq!(state_of(&fixed, "sales"), Some(InstallState::Installed));
}

#[test]
fn test_fixture_failure_is_attributed() {
    let ws = Workspace::new();
    ws.module("base", &[], &[("base.data", "create res.group 1\nfail\n")]);
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let err = manager
        .load_modules(None, &Directives::new().install(["base"]))
        .unwrap_err();
    match err {
        ModuleError::Load(error) => {
            assert_eq!(error.module(), Some("base"));
            assert!(matches!(
                error,
                LoadError::Module {
                    stage: LoadStage::Fixtures,
                    ..
                }
            ));
        }
        other => panic!("unexpected error: {}", other),
    }

    // Staged provenance of the failed module was discarded
    let txn = manager.storage().begin(ROOT_USER);
    assert!(ModelDataStore::for_module(&txn, "base").unwrap().is_empty());
    assert_eq!(state_of(&manager, "base"), Some(InstallState::ToInstall));
}

#[test]
fn test_interrupted_update_resumes_without_directives() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));
    manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap();

    let broken = ModuleManager::new(
        ws.registry(),
        Arc::clone(manager.storage()),
        collaborators(&journal, RecordingPool::new(journal.clone()).failing("sales")),
    );
    assert!(broken
        .load_modules(None, &Directives::new().update(["base"]))
        .is_err());
    assert_eq!(state_of(&manager, "base"), Some(InstallState::Installed));
    assert_eq!(state_of(&manager, "sales"), Some(InstallState::ToUpgrade));

    journal.clear();
    let report = manager.load_modules(None, &Directives::new()).unwrap();
    assert_eq!(report.installed, vec!["sales"]);
    assert_eq!(journal.matching("fixture:"), vec!["fixture:sales:to_upgrade"]);
    assert_eq!(state_of(&manager, "sales"), Some(InstallState::Installed));
}

#[test]
fn test_update_installs_newly_declared_dependency() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));
    manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap();

    ws.module("extra", &["ir"], &[("extra.data", "create res.extra 7\n")]);
    ws.module("sales", &["base", "extra"], &[("sales.data", SALES_DATA)]);
    manager.registry().rescan().unwrap();
    journal.clear();

    let report = manager
        .load_modules(None, &Directives::new().update(["sales"]))
        .unwrap();

    assert_eq!(report.installed, vec!["extra", "sales"]);
    assert_eq!(
        journal.matching("fixture:"),
        vec!["fixture:extra:to_install", "fixture:sales:to_upgrade"]
    );
    assert_eq!(state_of(&manager, "extra"), Some(InstallState::Installed));
    assert_eq!(state_of(&manager, "base"), Some(InstallState::Installed));
}

#[test]
fn test_removal_deletes_newest_first() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));
    manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap();

    assert_eq!(manager.schedule_removal(["sales"]).unwrap(), vec!["sales"]);
    assert_eq!(state_of(&manager, "sales"), Some(InstallState::ToRemove));
    journal.clear();

    let report = manager.load_modules(None, &Directives::new()).unwrap();

    assert_eq!(report.removed, vec!["sales"]);
    assert!(report.installed.is_empty());
    assert_eq!(
        journal.matching("delete:"),
        vec![
            "delete:sale.line:3",
            "delete:sale.order:2",
            "delete:sale.order:1"
        ]
    );
    assert_eq!(state_of(&manager, "sales"), Some(InstallState::NotInstalled));
    assert_eq!(state_of(&manager, "base"), Some(InstallState::Installed));

    let txn = manager.storage().begin(ROOT_USER);
    assert!(ModelDataStore::for_module(&txn, "sales").unwrap().is_empty());
    assert_eq!(ModelDataStore::for_module(&txn, "base").unwrap().len(), 1);
}

#[test]
fn test_schedule_removal_skips_builtins_and_unknown() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));
    manager
        .load_modules(None, &Directives::new().install(["base"]))
        .unwrap();

    let scheduled = manager.schedule_removal(["ir", "sales", "ghost"]).unwrap();
    assert!(scheduled.is_empty());
    assert_eq!(state_of(&manager, "ir"), Some(InstallState::Installed));
    assert_eq!(state_of(&manager, "sales"), None);
}

#[test]
fn test_stale_records_deleted_in_reverse_module_order() {
    let ws = Workspace::new();
    ws.module("base", &["ir"], &[("base.data", "stale res.group 10\n")]);
    ws.module(
        "sales",
        &["base"],
        &[("sales.data", "stale sale.order 20\nstale sale.order 21\n")],
    );
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let report = manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap();

    assert_eq!(
        journal.matching("delete:"),
        vec![
            "delete:sale.order:20",
            "delete:sale.order:21",
            "delete:res.group:10"
        ]
    );
    assert_eq!(
        report.deleted,
        vec![
            RecordRef::new("sale.order", 20),
            RecordRef::new("sale.order", 21),
            RecordRef::new("res.group", 10),
        ]
    );
}

#[test]
fn test_history_rebuilt_once_after_loading() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let pool = RecordingPool::new(journal.clone())
        .entity("base", "res.user", true)
        .entity("sales", "res.user", true)
        .entity("sales", "sale.order", false);
    let manager = ws.manager(&journal, pool);

    let report = manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap();

    assert_eq!(report.history_rebuilt, vec!["res.user"]);
    assert_eq!(journal.matching("history:"), vec!["history:res.user"]);
    assert_eq!(
        journal.matching("register:"),
        vec![
            "register:base:res.user",
            "register:sales:res.user",
            "register:sales:sale.order"
        ]
    );

    let events = journal.events();
    let history_at = events.iter().position(|e| e == "history:res.user").unwrap();
    let last_fixture = events.iter().rposition(|e| e.starts_with("fixture:")).unwrap();
    assert!(history_at > last_fixture);
}

#[test]
fn test_translations_for_requested_languages_only() {
    let ws = sales_workspace();
    ws.locale("base", "fr");
    ws.locale("base", "de");
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    // Added after the registry scan; picked up at load time
    ws.locale("sales", "fr");

    manager
        .load_modules(
            None,
            &Directives::new().install(["sales"]).languages(["fr"]),
        )
        .unwrap();

    assert_eq!(
        journal.matching("translation:"),
        vec!["translation:fr:base:fr.po", "translation:fr:sales:fr.po"]
    );
}

#[test]
fn test_default_languages_apply_without_directive() {
    let ws = sales_workspace();
    ws.locale("base", "fr");
    ws.locale("base", "de");
    let journal = Journal::default();
    let manager = ws
        .manager(&journal, RecordingPool::new(journal.clone()))
        .with_default_languages(vec!["de".to_string()]);

    manager
        .load_modules(None, &Directives::new().install(["base"]))
        .unwrap();

    assert_eq!(
        journal.matching("translation:"),
        vec!["translation:de:base:de.po"]
    );
}

#[test]
fn test_nested_run_leaves_outer_transaction_alone() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let mut outer = manager.storage().begin(7);
    outer.set_context("company", "1");
    outer.put(SEQUENCES_TREE, b"outer".to_vec(), vec![1]);

    manager
        .load_modules(Some(&outer), &Directives::new().install(["base"]))
        .unwrap();

    assert_eq!(journal.matching("txn:"), vec!["txn:0:0"]);
    assert!(outer.has_pending());
    assert_eq!(outer.user(), 7);
    assert_eq!(outer.context().len(), 1);
    assert_eq!(state_of(&manager, "base"), Some(InstallState::Installed));

    // The staged write never reached the database
    let fresh = manager.storage().begin(ROOT_USER);
    assert_eq!(fresh.get(SEQUENCES_TREE, b"outer").unwrap(), None);
    outer.rollback();
}

#[test]
fn test_missing_dependency_has_no_side_effects() {
    let ws = Workspace::new();
    ws.module("base", &["ir"], &[]);
    ws.module("sales", &["base", "shipping"], &[]);
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let err = manager
        .load_modules(None, &Directives::new().install(["sales"]))
        .unwrap_err();

    match err {
        ModuleError::Resolution(ResolutionError::MissingDependency { module, missing }) => {
            assert_eq!(module, "sales");
            assert_eq!(missing, "shipping");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(journal.events().is_empty());
    assert!(manager.module_states().unwrap().is_empty());
}

#[test]
fn test_unknown_module_is_rejected() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let err = manager
        .load_modules(None, &Directives::new().install(["ghost"]))
        .unwrap_err();
    assert!(matches!(
        err,
        ModuleError::Resolution(ResolutionError::ModuleNotFound(ref name)) if name == "ghost"
    ));
    assert!(journal.events().is_empty());
}

#[test]
fn test_cycle_is_rejected() {
    let ws = Workspace::new();
    ws.module("a", &["b"], &[]);
    ws.module("b", &["a"], &[]);
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let err = manager
        .load_modules(None, &Directives::new().install(["a"]))
        .unwrap_err();
    assert!(matches!(
        err,
        ModuleError::Resolution(ResolutionError::CircularDependency(ref name)) if name == "a"
    ));
    assert!(journal.events().is_empty());
}

#[test]
fn test_install_all_skips_tests_module() {
    let ws = sales_workspace();
    ws.module("tests", &["base"], &[]);
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    let report = manager
        .load_modules(None, &Directives::new().install(["all"]))
        .unwrap();

    assert_eq!(report.installed, vec!["ir", "base", "sales"]);
    assert!(!journal.events().contains(&"setup:tests".to_string()));
    assert_eq!(state_of(&manager, "tests"), None);
}

#[test]
fn test_register_classes_runs_plugins_in_order() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let plugin_journal = journal.clone();
    let plugins = PluginTable::new().with(
        "sales",
        Arc::new(FnRegistration(move |module: &str| {
            plugin_journal.push(format!("plugin:{}", module));
            Ok(())
        })),
    );
    let manager = ws
        .manager(&journal, RecordingPool::new(journal.clone()))
        .with_plugins(plugins);

    let activated = manager.register_classes().unwrap();
    assert_eq!(activated, vec!["ir", "base", "sales"]);
    assert_eq!(journal.events(), vec!["plugin:sales"]);
}

#[test]
fn test_register_classes_fails_on_vanished_module() {
    let ws = sales_workspace();
    let journal = Journal::default();
    let manager = ws.manager(&journal, RecordingPool::new(journal.clone()));

    fs::remove_dir_all(ws.modules_dir.join("sales")).unwrap();

    let err = manager.register_classes().unwrap_err();
    assert!(matches!(err, ModuleError::OperationError(ref msg) if msg.contains("sales")));
}
