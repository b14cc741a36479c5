// tests/workspace.rs

//! Integration tests for the filesystem side of the engine: integrity
//! checks, store GC, plan generation, and test-plan walks. Nothing here
//! needs a database or the schema applier.

mod common;

use sdm::engine::{Engine, WalkOptions};
use sdm::plan::{DataChangeKind, MigrationPlan, MigrationType};
use sdm::store::SchemaStore;
use sdm::testplan::TestKind;
use sdm::Error;
use std::fs;

#[test]
fn test_check_integrity_passes_on_fresh_workspace() {
    let ws = common::setup();
    let engine = Engine::load(ws.project.clone()).unwrap();
    engine.check_integrity(false).unwrap();
    engine.check_integrity(true).unwrap();
}

#[test]
fn test_check_integrity_names_missing_source_blob() {
    let ws = common::setup();
    let store = SchemaStore::new(ws.project.store_dir());
    let entries = store.read_manifest(&ws.table_manifest).unwrap();
    let missing = entries[0].hash.clone();
    fs::remove_file(store.path_for(&missing)).unwrap();

    let engine = Engine::load(ws.project.clone()).unwrap();
    let err = engine.check_integrity(true).unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
    assert!(err.to_string().contains(&missing));
}

#[test]
fn test_check_integrity_full_detects_tampering() {
    let ws = common::setup();
    let store = SchemaStore::new(ws.project.store_dir());
    let entries = store.read_manifest(&ws.table_manifest).unwrap();
    fs::write(store.path_for(&entries[0].hash), "ALTER TABLE tampered;").unwrap();

    let engine = Engine::load(ws.project.clone()).unwrap();
    // fast mode only checks existence
    engine.check_integrity(true).unwrap();
    assert!(engine.check_integrity(false).is_err());
}

#[test]
fn test_check_integrity_missing_data_file() {
    let ws = common::setup();
    let mut plan = MigrationPlan::new(
        "0003",
        "load_users",
        "tester",
        MigrationType::Data,
        sdm::plan::Change {
            forward: common::sql_change("x"),
            backward: None,
        },
        vec!["0002_insert_test_data".parse().unwrap()],
    );
    if let sdm::plan::ChangeStep::Data(data) = &mut plan.change.forward {
        data.kind = DataChangeKind::SqlFile;
        data.sql = None;
        data.file = Some("missing.sql".to_string());
    }
    plan.save(&ws.project.plan_dir()).unwrap();

    let engine = Engine::load(ws.project.clone()).unwrap();
    let err = engine.check_integrity(true).unwrap_err();
    assert!(err.to_string().contains("missing.sql"));
}

#[test]
fn test_clean_store_is_idempotent_and_keeps_reachable_blobs() {
    let ws = common::setup();
    fs::write(ws.project.store_dir().join("junk"), "junk").unwrap();
    fs::create_dir_all(ws.project.store_dir().join("00")).unwrap();
    fs::write(ws.project.store_dir().join("00/dead"), "dead").unwrap();

    let engine = Engine::load(ws.project.clone()).unwrap();
    let reported = engine.clean_store(true, false).unwrap();
    assert_eq!(reported.len(), 2);
    assert!(ws.project.store_dir().join("junk").exists());

    let deleted = engine.clean_store(false, false).unwrap();
    assert_eq!(deleted, reported);
    assert!(!ws.project.store_dir().join("junk").exists());

    // a second pass removes nothing and every plan still verifies
    assert!(engine.clean_store(false, false).unwrap().is_empty());
    engine.check_integrity(false).unwrap();
}

#[test]
fn test_make_data_extends_the_chain() {
    let ws = common::setup();
    let engine = Engine::load(ws.project.clone()).unwrap();
    let path = engine.make_data("more_rows", DataChangeKind::Sql, "tester").unwrap();
    assert!(path.ends_with("0003_more_rows.json"));

    let reloaded = Engine::load(ws.project.clone()).unwrap();
    assert_eq!(reloaded.plans().count(), 4);
    let latest = reloaded.plans().latest(None).unwrap();
    assert_eq!(latest.version, "0003");
    assert_eq!(latest.dependencies[0].to_string(), "0002_insert_test_data");
}

#[test]
fn test_make_repeatable_is_kept_out_of_the_chain() {
    let ws = common::setup();
    let engine = Engine::load(ws.project.clone()).unwrap();
    engine.make_repeatable("seed_data", DataChangeKind::Sql, "tester").unwrap();

    let reloaded = Engine::load(ws.project.clone()).unwrap();
    assert_eq!(reloaded.plans().count(), 3);
    assert_eq!(reloaded.plans().repeatable_plans().len(), 1);
    let plan = &reloaded.plans().repeatable_plans()[0];
    assert_eq!(plan.version, "R");
    assert_eq!(plan.plan_type, MigrationType::Repeatable);
}

#[test]
fn test_make_schema_detects_no_change_and_new_snapshot() {
    let ws = common::setup();
    let engine = Engine::load(ws.project.clone()).unwrap();
    // schema dir still matches the 0001 snapshot
    assert!(engine.make_schema("nothing_new", "tester").unwrap().is_none());

    fs::write(
        ws.project.schema_dir().join("othertable.sql"),
        "CREATE TABLE `othertable` (`id` int NOT NULL, PRIMARY KEY (`id`));\n",
    )
    .unwrap();
    let path = engine.make_schema("add_othertable", "tester").unwrap().unwrap();
    assert!(path.ends_with("0003_add_othertable.json"));

    let reloaded = Engine::load(ws.project.clone()).unwrap();
    reloaded.check_integrity(false).unwrap();
    let latest = reloaded.plans().latest(None).unwrap();
    assert_eq!(latest.plan_type, MigrationType::Schema);
    // backward points at the previous snapshot
    let backward = latest.change.backward.as_ref().unwrap().as_schema().unwrap();
    assert_eq!(backward.id, ws.table_manifest);
}

#[test]
fn test_generated_walks_use_signature_strings() {
    let ws = common::setup();
    let engine = Engine::load(ws.project.clone()).unwrap();
    let walk = WalkOptions::default();

    assert_eq!(
        engine.generate_test_plan(TestKind::StepForward, &walk).unwrap(),
        ["0000_init", "0001_new_test_table", "0002_insert_test_data"]
    );
    assert_eq!(
        engine.generate_test_plan(TestKind::SimpleForward, &walk).unwrap(),
        ["0000_init", "0002_insert_test_data"]
    );
    // 0001 (schema) and 0002 (data) both declare backwards, so the step
    // walk retreats all the way down after each advance
    assert_eq!(
        engine
            .generate_test_plan(TestKind::StepForwardBackward, &walk)
            .unwrap()
            .len(),
        6
    );
}

#[test]
fn test_test_gen_writes_plan_file() {
    let ws = common::setup();
    let engine = Engine::load(ws.project.clone()).unwrap();
    let output = ws.dir.path().join("test_plan.json");
    engine
        .test_gen(TestKind::StepForward, &output, &WalkOptions::default())
        .unwrap();

    let content = fs::read_to_string(&output).unwrap();
    let sigs: Vec<String> = serde_json::from_str(&content).unwrap();
    assert_eq!(sigs.len(), 3);
    assert_eq!(sigs[0], "0000_init");
}
