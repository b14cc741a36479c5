// tests/common/mod.rs

//! Shared workspace fixtures for integration tests.

#![allow(dead_code)]
//!
//! Builds the three-plan chain the scenario tests revolve around: an empty
//! initial schema, a schema plan creating `testtable`, and a data plan
//! seeding one row.

use sdm::checksum::sha1_hex;
use sdm::plan::{
    Change, ChangeStep, DataChange, DataChangeKind, MigrationPlan, MigrationSignature,
    MigrationType, SchemaChange,
};
use sdm::project::Project;
use sdm::store::SchemaStore;
use std::fs;
use tempfile::TempDir;

pub const TABLE_SQL: &str =
    "CREATE TABLE `testtable` (\n  `id` int NOT NULL,\n  `name` varchar(255),\n  PRIMARY KEY (`id`)\n);\n";

pub struct Workspace {
    // holds the tempdir alive for the project paths
    pub dir: TempDir,
    pub project: Project,
    pub init_manifest: String,
    pub table_manifest: String,
}

/// Write one schema snapshot (source blobs + manifest) and return the
/// manifest hash.
pub fn write_snapshot(store: &SchemaStore, files: &[(&str, &str)]) -> String {
    let mut sources: Vec<(String, &str, &str)> = files
        .iter()
        .map(|(name, content)| (sha1_hex(&[*content]), *name, *content))
        .collect();
    sources.sort_by(|a, b| a.0.cmp(&b.0));

    let hashes: Vec<&str> = sources.iter().map(|(hash, _, _)| hash.as_str()).collect();
    let index = sha1_hex(&hashes);
    let content = sources
        .iter()
        .map(|(hash, name, _)| format!("{}:{}", hash, name))
        .collect::<Vec<_>>()
        .join("\n");
    store.write(&index, &content).unwrap();
    for (hash, _, content) in &sources {
        store.write(hash, content).unwrap();
    }
    index
}

pub fn schema_plan(
    version: &str,
    name: &str,
    forward_id: &str,
    backward_id: Option<&str>,
    deps: Vec<MigrationSignature>,
) -> MigrationPlan {
    MigrationPlan::new(
        version,
        name,
        "tester",
        MigrationType::Schema,
        Change {
            forward: ChangeStep::Schema(SchemaChange {
                id: forward_id.to_string(),
                precheck: None,
                postcheck: None,
            }),
            backward: backward_id.map(|id| {
                ChangeStep::Schema(SchemaChange {
                    id: id.to_string(),
                    precheck: None,
                    postcheck: None,
                })
            }),
        },
        deps,
    )
}

pub fn sql_change(sql: &str) -> ChangeStep {
    ChangeStep::Data(DataChange {
        kind: DataChangeKind::Sql,
        sql: Some(sql.to_string()),
        file: None,
        precheck: None,
        postcheck: None,
    })
}

/// A populated workspace: plan chain 0000_init -> 0001_new_test_table ->
/// 0002_insert_test_data, the store blobs behind both schema snapshots, and
/// the schema dir matching the latest snapshot.
pub fn setup() -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    let project = Project::new(dir.path());
    for path in [
        project.plan_dir(),
        project.schema_dir(),
        project.data_dir(),
        project.store_dir(),
    ] {
        fs::create_dir_all(path).unwrap();
    }
    fs::write(project.schema_dir().join("testtable.sql"), TABLE_SQL).unwrap();

    let store = SchemaStore::new(project.store_dir());
    let init_manifest = write_snapshot(&store, &[]);
    let table_manifest = write_snapshot(&store, &[("testtable.sql", TABLE_SQL)]);

    let init = schema_plan("0000", "init", &init_manifest, None, vec![]);
    init.save(&project.plan_dir()).unwrap();

    let create_table = schema_plan(
        "0001",
        "new_test_table",
        &table_manifest,
        Some(&init_manifest),
        vec![init.sig()],
    );
    create_table.save(&project.plan_dir()).unwrap();

    let insert_data = MigrationPlan::new(
        "0002",
        "insert_test_data",
        "tester",
        MigrationType::Data,
        Change {
            forward: sql_change("INSERT INTO `testtable` (`id`, `name`) VALUES (1, 'foo');"),
            backward: Some(sql_change("DELETE FROM `testtable` WHERE `id` = 1;")),
        },
        vec![create_table.sig()],
    );
    insert_data.save(&project.plan_dir()).unwrap();

    Workspace {
        dir,
        project,
        init_manifest,
        table_manifest,
    }
}
