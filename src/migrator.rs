// src/migrator.rs

//! Applies a single migration plan forward or backward
//!
//! Schema changes are materialized from the store into a temp directory and
//! handed to the schema applier. Data changes dispatch on their kind:
//! inline SQL and SQL files run on a fresh connection inside a transaction;
//! shell, python, and typescript payloads are subprocesses fed the
//! environment contract (`MYSQL_PWD`, `HOST`, `PORT`, `USER`, `SCHEMA`,
//! `SDM_DATA_DIR`, and for condition checks `SDM_EXPECTED` /
//! `SDM_CHECKSUM_MATCH`).

use crate::checksum::truncate_str;
use crate::db;
use crate::environment::{EnvSection, ENV_SDM_CHECKSUM_MATCH, ENV_SDM_EXPECTED};
use crate::error::{Error, Result};
use crate::plan::{
    ChangeStep, ConditionCheck, DataChange, DataChangeKind, MigrationPlan, MigrationType,
};
use crate::project::{Project, SCHEMA_DIR};
use crate::skeema::SchemaApplier;
use crate::store::SchemaStore;
use mysql::prelude::Queryable;
use mysql::{Row, TxOpts};
use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::Command;
use tracing::info;

/// Driver compiled next to the user's `migration.ts`; it runs the exported
/// `run()` and turns its result into the process exit status.
const TYPESCRIPT_DRIVER: &str = r#"import { run } from "./migration";

run()
    .then((code) => process.exit(code ?? 0))
    .catch((err) => {
        console.error(err);
        process.exit(1);
    });
"#;

/// Everything an execution needs to reach the target environment.
pub struct MigrationContext {
    pub env_name: String,
    pub section: EnvSection,
    pub password: String,
}

pub struct Migrator {
    project: Project,
    store: SchemaStore,
    applier: SchemaApplier,
    /// Pass --allow-unsafe to forward schema pushes as well
    allow_unsafe: bool,
}

impl Migrator {
    pub fn new(project: Project, applier: SchemaApplier) -> Self {
        let store = SchemaStore::new(project.store_dir());
        let allow_unsafe = std::env::var("SDM_ALLOW_UNSAFE").is_ok_and(|v| v == "1");
        Self {
            project,
            store,
            applier,
            allow_unsafe,
        }
    }

    /// Apply the plan's forward change, guarded by its condition checks.
    pub fn forward(
        &self,
        plan: &MigrationPlan,
        ctx: &MigrationContext,
        checksum_match: Option<bool>,
    ) -> Result<()> {
        info!("Executing {}", plan);
        let forward = &plan.change.forward;
        if let Some(check) = forward.precheck() {
            if !self.check_condition(check, ctx, checksum_match)? {
                return Err(Error::ConditionCheckFailed(format!("precheck failed for {}", plan)));
            }
        }
        self.apply_step(plan, forward, ctx, self.allow_unsafe)?;
        if let Some(check) = forward.postcheck() {
            if !self.check_condition(check, ctx, None)? {
                return Err(Error::ConditionCheckFailed(format!("postcheck failed for {}", plan)));
            }
        }
        Ok(())
    }

    /// Apply the plan's backward change; a plan without one is a no-op.
    /// Schema rollbacks always allow unsafe DDL.
    pub fn backward(&self, plan: &MigrationPlan, ctx: &MigrationContext) -> Result<()> {
        info!("Rolling back {}", plan);
        let Some(backward) = &plan.change.backward else {
            info!("No backward change for {}", plan);
            return Ok(());
        };
        if let Some(check) = backward.precheck() {
            if !self.check_condition(check, ctx, None)? {
                return Err(Error::ConditionCheckFailed(format!("precheck failed for {}", plan)));
            }
        }
        self.apply_step(plan, backward, ctx, true)?;
        if let Some(check) = backward.postcheck() {
            if !self.check_condition(check, ctx, None)? {
                return Err(Error::ConditionCheckFailed(format!("postcheck failed for {}", plan)));
            }
        }
        Ok(())
    }

    fn apply_step(
        &self,
        plan: &MigrationPlan,
        step: &ChangeStep,
        ctx: &MigrationContext,
        allow_unsafe: bool,
    ) -> Result<()> {
        match plan.plan_type {
            MigrationType::Schema => {
                let schema = step.as_schema().ok_or_else(|| {
                    Error::Integrity(format!("schema plan without a manifest id, {}", plan))
                })?;
                self.apply_schema(&schema.id, ctx, allow_unsafe)
            }
            MigrationType::Data | MigrationType::Repeatable => {
                let data = step.as_data().ok_or_else(|| {
                    Error::Integrity(format!("data plan without a data change, {}", plan))
                })?;
                self.apply_data(data, ctx)
            }
        }
    }

    /// Materialize the manifest into a temp schema dir beside the applier
    /// config and push it.
    fn apply_schema(&self, manifest_id: &str, ctx: &MigrationContext, allow_unsafe: bool) -> Result<()> {
        let temp = tempfile::tempdir()?;
        let schema_sub = temp.path().join(SCHEMA_DIR);
        fs::create_dir_all(&schema_sub)?;
        fs::copy(self.project.env_file(), schema_sub.join(".skeema"))?;
        self.store.materialize(manifest_id, &schema_sub)?;
        self.applier.push(&ctx.env_name, allow_unsafe, temp.path())
    }

    fn apply_data(&self, data: &DataChange, ctx: &MigrationContext) -> Result<()> {
        match data.kind {
            DataChangeKind::Sql => {
                let sql = data
                    .sql
                    .as_deref()
                    .ok_or_else(|| Error::Integrity("sql is empty".to_string()))?;
                self.run_sql(sql, ctx)
            }
            DataChangeKind::SqlFile => {
                let sql = fs::read_to_string(self.data_file(data.file.as_deref())?)?;
                self.run_sql(&sql, ctx)
            }
            DataChangeKind::Shell | DataChangeKind::Python | DataChangeKind::Typescript => {
                let file = data.file.as_deref();
                let code = self.run_script(data.kind, self.data_file(file)?.as_path(), ctx, None, None)?;
                if code != 0 {
                    return Err(Error::ExternalTool(format!(
                        "{} migration {} exited with code {}",
                        data.kind,
                        file.unwrap_or(""),
                        code
                    )));
                }
                Ok(())
            }
        }
    }

    fn data_file(&self, file: Option<&str>) -> Result<std::path::PathBuf> {
        let file =
            file.ok_or_else(|| Error::Integrity("data migration file is empty".to_string()))?;
        Ok(self.project.data_dir().join(file))
    }

    /// Execute SQL on a fresh connection inside a committed transaction.
    fn run_sql(&self, sql: &str, ctx: &MigrationContext) -> Result<()> {
        let mut conn = db::connect(&ctx.section, &ctx.password)?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        let result = tx.query_iter(sql)?;
        let affected = result.affected_rows();
        drop(result);
        tx.commit()?;
        info!("Migrated SQL={}, affected_rows={}", truncate_str(sql, 200), affected);
        Ok(())
    }

    /// Evaluate a condition check. SQL kinds compare the first column of
    /// the first row with the expected value; script kinds compare the
    /// process exit status (a failing build counts as a failed check, not
    /// an error).
    pub fn check_condition(
        &self,
        check: &ConditionCheck,
        ctx: &MigrationContext,
        checksum_match: Option<bool>,
    ) -> Result<bool> {
        match check.kind {
            DataChangeKind::Sql => {
                let sql = check
                    .sql
                    .as_deref()
                    .ok_or_else(|| Error::Integrity("condition check sql is empty".to_string()))?;
                self.check_sql(sql, check.expected, ctx)
            }
            DataChangeKind::SqlFile => {
                let sql = fs::read_to_string(self.data_file(check.file.as_deref())?)?;
                self.check_sql(&sql, check.expected, ctx)
            }
            DataChangeKind::Shell | DataChangeKind::Python | DataChangeKind::Typescript => {
                let path = self.data_file(check.file.as_deref())?;
                match self.run_script(check.kind, &path, ctx, check.expected, checksum_match) {
                    Ok(code) => Ok(i64::from(code) == check.expected.unwrap_or(0)),
                    Err(Error::ExternalTool(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    fn check_sql(&self, sql: &str, expected: Option<i64>, ctx: &MigrationContext) -> Result<bool> {
        let mut conn = db::connect(&ctx.section, &ctx.password)?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        let row: Option<Row> = tx.query_first(sql)?;
        tx.commit()?;
        let value: Option<i64> = row.and_then(|r| r.get(0));
        info!(
            "Check condition, SQL={}, result={:?}",
            truncate_str(sql, 200),
            value
        );
        Ok(value == Some(expected.unwrap_or(0)))
    }

    /// Run a script payload and return its exit status.
    fn run_script(
        &self,
        kind: DataChangeKind,
        file_path: &Path,
        ctx: &MigrationContext,
        expected: Option<i64>,
        checksum_match: Option<bool>,
    ) -> Result<i32> {
        let mut envs = ctx.section.subprocess_env(&ctx.password, &self.project.data_dir());
        if let Some(expected) = expected {
            envs.push((ENV_SDM_EXPECTED.to_string(), expected.to_string()));
        }
        if let Some(matched) = checksum_match {
            envs.push((
                ENV_SDM_CHECKSUM_MATCH.to_string(),
                if matched { "1" } else { "0" }.to_string(),
            ));
        }
        match kind {
            DataChangeKind::Shell => {
                self.spawn("sh", &[file_path.as_os_str()], self.project.root(), &envs)
            }
            DataChangeKind::Python => {
                self.spawn("python3", &[file_path.as_os_str()], self.project.root(), &envs)
            }
            DataChangeKind::Typescript => self.run_typescript(file_path, &envs),
            DataChangeKind::Sql | DataChangeKind::SqlFile => {
                Err(Error::Integrity(format!("{} is not a script kind", kind)))
            }
        }
    }

    /// Compile the typescript payload in a temp build context that resolves
    /// the workspace package.json, then run it.
    fn run_typescript(&self, file_path: &Path, envs: &[(String, String)]) -> Result<i32> {
        let temp = tempfile::Builder::new()
            .prefix("tmp-ts-")
            .tempdir_in(self.project.root())?;
        let src = temp.path().join("src");
        fs::create_dir_all(&src)?;
        fs::write(src.join("index.ts"), TYPESCRIPT_DRIVER)?;
        fs::copy(file_path, src.join("migration.ts"))?;

        let build = self.spawn(
            "npm",
            &[OsStr::new("run"), OsStr::new("build")],
            temp.path(),
            &[],
        )?;
        if build != 0 {
            return Err(Error::ExternalTool(format!(
                "npm run build exited with code {}",
                build
            )));
        }
        self.spawn("node", &[OsStr::new("src/index.js")], temp.path(), envs)
    }

    fn spawn(
        &self,
        program: &str,
        args: &[&OsStr],
        cwd: &Path,
        envs: &[(String, String)],
    ) -> Result<i32> {
        let status = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()
            .map_err(|e| Error::ExternalTool(format!("failed to run {}: {}", program, e)))?;
        Ok(status.code().unwrap_or(-1))
    }
}
