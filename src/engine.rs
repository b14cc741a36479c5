// src/engine.rs

//! Migration orchestrator
//!
//! Ties the plan manager, schema store, history DAO, and migrator together
//! into the command-level state machines. The invariant maintained across
//! every transaction boundary: at most one versioned history row is in a
//! non-SUCCESSFUL state at any persisted moment, and that row is all `fix`
//! needs to recover after a crash.

use crate::db::history::{HistoryDao, MigrationState};
use crate::db::{self, TableNames};
use crate::environment::EnvFile;
use crate::error::{Error, Result};
use crate::migrator::{MigrationContext, Migrator};
use crate::plan::manager::{PlanManager, PlanRef, SortAlg};
use crate::plan::{
    pad_version, Change, ChangeStep, DataChange, DataChangeKind, MigrationPlan,
    MigrationSignature, MigrationType, SchemaChange, REPEATABLE_VERSION,
};
use crate::project::{self, Project};
use crate::skeema::SchemaApplier;
use crate::store::{GcMode, SchemaStore, VerifyMode};
use crate::testplan::{signatures_to_walk, walk_to_signatures, TestKind, TestPlanGenerator};
use mysql::prelude::Queryable;
use mysql::{Conn, TxOpts};
use prettytable::{row, Table};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct MigrateOptions {
    pub environment: String,
    pub version: Option<String>,
    pub name: Option<String>,
    pub fake: bool,
    pub dry_run: bool,
    pub operator: String,
}

#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    pub environment: String,
    pub version: String,
    pub name: Option<String>,
    pub fake: bool,
    pub dry_run: bool,
    pub operator: String,
}

#[derive(Debug, Clone, Default)]
pub struct FixOptions {
    pub environment: String,
    pub fake: bool,
    pub operator: String,
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub schema: String,
    pub author: String,
}

/// Knobs of the monkey walk generator.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub walk_len: Option<usize>,
    pub start: Option<String>,
    pub important: Option<String>,
    pub non_important: Option<String>,
}

/// What a `diff`/`pull` argument refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffItem {
    Head,
    Version,
    Environment,
}

fn diff_item_type(arg: &str) -> DiffItem {
    if arg == "HEAD" {
        return DiffItem::Head;
    }
    if arg.chars().all(|c| c.is_ascii_digit()) && !arg.is_empty() {
        return DiffItem::Version;
    }
    match arg.split_once('_') {
        Some((ver, _)) if ver.chars().all(|c| c.is_ascii_digit()) && !ver.is_empty() => {
            DiffItem::Version
        }
        _ => DiffItem::Environment,
    }
}

pub struct Engine {
    project: Project,
    store: SchemaStore,
    plans: PlanManager,
    applier: SchemaApplier,
    migrator: Migrator,
    tables: TableNames,
}

impl Engine {
    /// Load the workspace with the production dependency ordering.
    pub fn load(project: Project) -> Result<Self> {
        Self::load_with(project, SortAlg::default())
    }

    pub fn load_with(project: Project, alg: SortAlg) -> Result<Self> {
        let plans = PlanManager::load_with(&project.plan_dir(), alg)?;
        let store = SchemaStore::new(project.store_dir());
        let migrator = Migrator::new(project.clone(), SchemaApplier::new());
        Ok(Self {
            project,
            store,
            plans,
            applier: SchemaApplier::new(),
            migrator,
            tables: TableNames::default(),
        })
    }

    pub fn plans(&self) -> &PlanManager {
        &self.plans
    }

    /// Initialize a fresh workspace: plan/schema/data/store directories,
    /// the seeded store, the initial plan, and the support files.
    pub fn init(project: &Project, applier: &SchemaApplier, opts: &InitOptions) -> Result<()> {
        project.check_not_initialized()?;
        fs::create_dir_all(project.plan_dir())?;
        applier.init(
            &opts.host,
            opts.port,
            &opts.user,
            &opts.schema,
            project::SCHEMA_DIR,
            db::DEFAULT_HISTORY_TABLE,
            project.root(),
        )?;

        let store = SchemaStore::new(project.store_dir());
        store.init_layout()?;
        let (sql_files, index_sha1, index_content) = project.read_sql_files()?;
        store.write(&index_sha1, &index_content)?;
        for file in &sql_files {
            store.write(&file.sha1, &file.content)?;
        }

        let init_plan = MigrationPlan::new(
            "0000",
            "init",
            &opts.author,
            MigrationType::Schema,
            Change {
                forward: ChangeStep::Schema(SchemaChange {
                    id: index_sha1,
                    precheck: None,
                    postcheck: None,
                }),
                backward: None,
            },
            vec![],
        );
        init_plan.save(&project.plan_dir())?;

        fs::create_dir_all(project.data_dir())?;
        project.scaffold(&project.mysql_pwd())?;
        Ok(())
    }

    /// Register another environment in the applier's `.skeema` file.
    pub fn add_environment(
        project: &Project,
        applier: &SchemaApplier,
        env: &str,
        host: &str,
        port: u16,
        user: &str,
    ) -> Result<()> {
        applier.add_environment(
            env,
            host,
            port,
            user,
            project::SCHEMA_DIR,
            db::DEFAULT_HISTORY_TABLE,
            project.root(),
        )
    }

    fn context(&self, env_name: &str) -> Result<MigrationContext> {
        let env_file = EnvFile::load(&self.project.env_file())?;
        Ok(MigrationContext {
            env_name: env_name.to_string(),
            section: env_file.section(env_name)?,
            password: self.project.mysql_pwd(),
        })
    }

    fn connect(&self, ctx: &MigrationContext) -> Result<Conn> {
        let mut conn = db::connect(&ctx.section, &ctx.password)?;
        db::ensure_tables(&mut conn, &self.tables)?;
        Ok(conn)
    }

    fn dao(&self) -> HistoryDao {
        HistoryDao::new(self.tables.clone(), self.project.data_dir())
    }

    fn plan_checksum(&self, plan: &MigrationPlan) -> Result<String> {
        plan.checksum(&self.project.data_dir())
    }

    /// Pre-flight reconciliation: the versioned history must be a prefix of
    /// the plan chain matching on `(version, name, checksum)`, all
    /// SUCCESSFUL except (in fix mode) the last row.
    fn check_histories(
        &self,
        histories: &[crate::db::history::MigrationHistory],
        fix_mode: bool,
    ) -> Result<()> {
        if histories.len() > self.plans.count() {
            return Err(Error::Integrity(format!(
                "unexpected migration history, len(histories)={}, len(plans)={}",
                histories.len(),
                self.plans.count()
            )));
        }
        for (idx, hist) in histories.iter().enumerate() {
            if hist.state != MigrationState::Successful {
                let fixable = fix_mode
                    && idx == histories.len() - 1
                    && matches!(
                        hist.state,
                        MigrationState::Processing | MigrationState::Rollbacking
                    );
                if !fixable {
                    return Err(Error::Integrity(format!(
                        "migration is not successful, version={}, name={}",
                        hist.ver, hist.name
                    )));
                }
                continue;
            }
            let plan = self.plans.get(idx).ok_or_else(|| {
                Error::Integrity(format!("no plan at history position {}", idx))
            })?;
            if !hist.can_match(&plan.version, &plan.name, &self.plan_checksum(plan)?) {
                return Err(Error::Integrity(format!(
                    "unexpected migration history, version={}, name={}, checksum={}",
                    hist.ver, hist.name, hist.checksum
                )));
            }
        }
        Ok(())
    }

    /// Apply pending versioned plans up to the target, then run the
    /// repeatable scheduler over the applied prefix.
    pub fn migrate(&self, opts: &MigrateOptions) -> Result<()> {
        if opts.dry_run {
            info!("Running in dry run mode, no migration will be executed");
        }
        self.check_integrity(false)?;
        debug!(
            "Migrate options: ver={:?}, name={:?}, fake={}, dry_run={}",
            opts.version, opts.name, opts.fake, opts.dry_run
        );

        let target = opts
            .version
            .as_ref()
            .map(|v| MigrationSignature::new(&pad_version(v), opts.name.as_deref()));
        let ctx = self.context(&opts.environment)?;
        let mut conn = self.connect(&ctx)?;
        let dao = self.dao();

        let (applied, pending) =
            self.migrate_versioned(&mut conn, &dao, &ctx, target.as_ref(), opts)?;
        let repeatable =
            self.migrate_repeatable(&mut conn, &dao, &ctx, &applied, target.as_ref(), opts)?;

        if opts.dry_run {
            info!("Migration plans to execute:");
            print_plan_table(pending.into_iter().chain(repeatable));
        }
        Ok(())
    }

    /// Returns the applied plan prefix and, for dry runs, the plans that
    /// would execute.
    fn migrate_versioned<'a>(
        &'a self,
        conn: &mut Conn,
        dao: &HistoryDao,
        ctx: &MigrationContext,
        target: Option<&MigrationSignature>,
        opts: &MigrateOptions,
    ) -> Result<(Vec<&'a MigrationPlan>, Vec<&'a MigrationPlan>)> {
        let mut tx = conn.start_transaction(TxOpts::default())?;
        let histories = dao.get_all_versioned(&mut tx)?;
        self.check_histories(&histories, false)?;

        let applied_count = histories.len();
        let mut applied: Vec<&MigrationPlan> = self.plans.plans()[..applied_count].iter().collect();
        if applied_count == self.plans.count() {
            tx.commit()?;
            return Ok((applied, Vec::new()));
        }

        let new_plans: Vec<&MigrationPlan> = self
            .plans
            .between(
                Some(PlanRef::Index(applied_count)),
                target.cloned().map(PlanRef::Sig),
            )?
            .iter()
            .collect();
        if !new_plans.is_empty() {
            if opts.dry_run {
                tx.commit()?;
                return Ok((applied, new_plans));
            }
            dao.add_one(&mut tx, new_plans[0], &opts.operator, opts.fake)?;
        }
        tx.commit()?;

        let executed = new_plans.clone();
        let mut queue = new_plans;
        while let Some(&plan) = queue.first() {
            if !opts.fake {
                self.migrator.forward(plan, ctx, None)?;
            }
            let mut tx = conn.start_transaction(TxOpts::default())?;
            let latest = dao
                .get_latest_versioned(&mut tx)?
                .ok_or_else(|| Error::Integrity("latest migration history not found".to_string()))?;
            if !latest.can_match(&plan.version, &plan.name, &self.plan_checksum(plan)?) {
                return Err(Error::Integrity(format!(
                    "unexpected migration history, version={}, name={}, checksum={}",
                    latest.ver, latest.name, latest.checksum
                )));
            }
            if latest.state != MigrationState::Processing {
                return Err(Error::Integrity(format!(
                    "unexpected migration history state, version={}, name={}, state={}",
                    latest.ver,
                    latest.name,
                    latest.state.as_str()
                )));
            }
            dao.update_succ(&mut tx, plan, &opts.operator, opts.fake)?;
            applied.push(plan);
            queue.remove(0);
            if let Some(&next) = queue.first() {
                dao.add_one(&mut tx, next, &opts.operator, opts.fake)?;
            }
            tx.commit()?;
        }
        Ok((applied, executed))
    }

    /// The repeatable scheduler: execute every repeatable plan whose
    /// dependency is applied, whose ignore_after is not, and whose checksum
    /// or state requires a (re-)run.
    fn migrate_repeatable<'a>(
        &'a self,
        conn: &mut Conn,
        dao: &HistoryDao,
        ctx: &MigrationContext,
        applied: &[&'a MigrationPlan],
        target: Option<&MigrationSignature>,
        opts: &MigrateOptions,
    ) -> Result<Vec<&'a MigrationPlan>> {
        if opts.fake {
            // repeatable migrations are neither executed nor recorded when faking
            return Ok(Vec::new());
        }

        if opts.dry_run {
            // assume the whole range up to the target were applied
            let hypothetical: Vec<&MigrationPlan> = match target {
                Some(sig) => self
                    .plans
                    .between(None, Some(PlanRef::Sig(sig.clone())))?
                    .iter()
                    .collect(),
                None => self.plans.plans().iter().collect(),
            };
            let to_execute = self.to_execute_repeatable(conn, dao, &hypothetical)?;
            return Ok(to_execute.into_iter().map(|(plan, _)| plan).collect());
        }

        let to_execute = self.to_execute_repeatable(conn, dao, applied)?;
        if to_execute.is_empty() {
            debug!("No valid repeatable migration to execute");
            return Ok(Vec::new());
        }

        let mut executed = Vec::new();
        for (plan, checksum_match) in to_execute {
            let mut tx = conn.start_transaction(TxOpts::default())?;
            match dao.get_by_sig(&mut tx, &plan.sig())? {
                None => dao.add_one(&mut tx, plan, &opts.operator, opts.fake)?,
                // re-marking PROCESSING counts as retrying the migration
                Some(_) => dao.update_processing(&mut tx, plan, &opts.operator)?,
            }
            tx.commit()?;

            self.migrator.forward(plan, ctx, Some(checksum_match))?;

            let mut tx = conn.start_transaction(TxOpts::default())?;
            dao.update_succ(&mut tx, plan, &opts.operator, opts.fake)?;
            tx.commit()?;
            executed.push(plan);
        }
        Ok(executed)
    }

    fn to_execute_repeatable<'a>(
        &'a self,
        conn: &mut Conn,
        dao: &HistoryDao,
        applied: &[&MigrationPlan],
    ) -> Result<Vec<(&'a MigrationPlan, bool)>> {
        let mut result = Vec::new();
        for plan in self.plans.repeatable_plans() {
            if let Some(dep) = plan.dependencies.first() {
                if !applied.iter().any(|p| p.matches(dep)) {
                    warn!(
                        "repeatable migration {} is not executed because dependency {} is not applied",
                        plan, dep
                    );
                    continue;
                }
            }
            if let Some(ignore) = &plan.ignore_after {
                if applied.iter().any(|p| p.matches(ignore)) {
                    debug!(
                        "Repeatable migration {} is not executed because ignore_after {} is applied",
                        plan, ignore
                    );
                    continue;
                }
            }

            let hist = dao.get_by_sig_dto(conn, &plan.sig())?;
            let checksum = self.plan_checksum(plan)?;
            // a SQL precheck is deterministic, script prechecks must always
            // be re-evaluated
            let deterministic_precheck = match plan.change.forward.precheck() {
                None => true,
                Some(check) => {
                    matches!(check.kind, DataChangeKind::Sql | DataChangeKind::SqlFile)
                }
            };
            if let Some(hist) = &hist {
                if hist.checksum == checksum
                    && hist.state == MigrationState::Successful
                    && deterministic_precheck
                {
                    debug!(
                        "Repeatable migration {} is not executed because it has been executed",
                        plan
                    );
                    continue;
                }
            }
            let checksum_match = hist.map(|h| h.checksum == checksum).unwrap_or(false);
            result.push((plan, checksum_match));
        }
        Ok(result)
    }

    /// Unwind the chain down to (but not including) the target plan,
    /// cascading dependent repeatable migrations before each versioned
    /// step.
    pub fn rollback(&self, opts: &RollbackOptions) -> Result<()> {
        self.check_integrity(false)?;
        let sig = MigrationSignature::new(&pad_version(&opts.version), opts.name.as_deref());
        let (target_idx, _) = self.plans.must_by_signature(&sig)?;
        let ctx = self.context(&opts.environment)?;
        let mut conn = self.connect(&ctx)?;
        let dao = self.dao();
        let inverse = self.plans.repeatable_inverse_dependencies();

        let mut tx = conn.start_transaction(TxOpts::default())?;
        let histories = dao.get_all_versioned(&mut tx)?;
        self.check_histories(&histories, false)?;

        if histories.len() <= target_idx {
            return Err(Error::Usage(
                "target migration plan is not applied yet".to_string(),
            ));
        }
        let latest_idx = histories.len() - 1;
        if target_idx == latest_idx {
            tx.commit()?;
            return Ok(());
        }

        let mut to_rollback: Vec<&MigrationPlan> = self
            .plans
            .between(Some(PlanRef::Index(target_idx + 1)), Some(PlanRef::Index(latest_idx)))?
            .iter()
            .collect();

        if opts.dry_run {
            let mut display: Vec<&MigrationPlan> = Vec::new();
            for &plan in &to_rollback {
                display.push(plan);
                if let Some(sigs) = inverse.get(&plan.sig()) {
                    for rsig in sigs {
                        if dao.get_by_sig(&mut tx, rsig)?.is_some() {
                            display.push(self.plans.must_repeatable_by_signature(rsig)?);
                        }
                    }
                }
            }
            tx.commit()?;
            info!("Migration plans to rollback:");
            print_plan_table(display.into_iter().rev());
            return Ok(());
        }

        let last = to_rollback
            .last()
            .copied()
            .ok_or_else(|| Error::Integrity("nothing to roll back".to_string()))?;
        dao.update_rollback(&mut tx, last, &opts.operator, opts.fake)?;
        tx.commit()?;

        while let Some(&plan) = to_rollback.last() {
            // dependent repeatable migrations go first
            self.rollback_repeatables(&mut conn, &dao, &ctx, plan, &inverse, opts)?;

            if !opts.fake {
                self.migrator.backward(plan, &ctx)?;
            }

            let mut tx = conn.start_transaction(TxOpts::default())?;
            let latest = dao
                .get_latest_versioned(&mut tx)?
                .ok_or_else(|| Error::Integrity("latest migration history not found".to_string()))?;
            if !latest.can_match(&plan.version, &plan.name, &self.plan_checksum(plan)?) {
                return Err(Error::Integrity(format!(
                    "unexpected migration history, version={}, name={}, checksum={}",
                    latest.ver, latest.name, latest.checksum
                )));
            }
            if latest.state != MigrationState::Rollbacking {
                return Err(Error::Integrity(format!(
                    "unexpected migration history state, version={}, name={}, state={}",
                    latest.ver,
                    latest.name,
                    latest.state.as_str()
                )));
            }
            dao.delete(&mut tx, plan, &opts.operator, opts.fake)?;
            to_rollback.pop();
            if let Some(&next) = to_rollback.last() {
                dao.update_rollback(&mut tx, next, &opts.operator, opts.fake)?;
            }
            tx.commit()?;
        }
        Ok(())
    }

    fn rollback_repeatables(
        &self,
        conn: &mut Conn,
        dao: &HistoryDao,
        ctx: &MigrationContext,
        versioned: &MigrationPlan,
        inverse: &std::collections::HashMap<MigrationSignature, Vec<MigrationSignature>>,
        opts: &RollbackOptions,
    ) -> Result<()> {
        let Some(sigs) = inverse.get(&versioned.sig()) else {
            return Ok(());
        };
        for sig in sigs {
            let plan = self.plans.must_repeatable_by_signature(sig)?;
            let mut tx = conn.start_transaction(TxOpts::default())?;
            if dao.get_by_sig(&mut tx, sig)?.is_none() {
                debug!("Migration history not found, so skip rollback {}", sig);
                tx.commit()?;
                continue;
            }
            dao.update_rollback(&mut tx, plan, &opts.operator, opts.fake)?;
            tx.commit()?;

            if !opts.fake {
                self.migrator.backward(plan, ctx)?;
            }

            let mut tx = conn.start_transaction(TxOpts::default())?;
            dao.delete(&mut tx, plan, &opts.operator, opts.fake)?;
            tx.commit()?;
        }
        Ok(())
    }

    pub fn fix_migrate(&self, opts: &FixOptions) -> Result<()> {
        self.fix(true, opts)
    }

    pub fn fix_rollback(&self, opts: &FixOptions) -> Result<()> {
        self.fix(false, opts)
    }

    /// Complete (forward) or unwind (backward) the single non-SUCCESSFUL
    /// history row left behind by a crash.
    fn fix(&self, forward: bool, opts: &FixOptions) -> Result<()> {
        let ctx = self.context(&opts.environment)?;
        let mut conn = self.connect(&ctx)?;
        let dao = self.dao();

        let mut tx = conn.start_transaction(TxOpts::default())?;
        let histories = dao.get_all_versioned(&mut tx)?;
        self.check_histories(&histories, true)?;

        let needs_fix = histories
            .last()
            .is_some_and(|last| last.state != MigrationState::Successful);
        if !needs_fix {
            info!("No need to fix migration");
            tx.commit()?;
            return Ok(());
        }

        let target = self.plans.get(histories.len() - 1).ok_or_else(|| {
            Error::Integrity(format!("no plan at history position {}", histories.len() - 1))
        })?;
        if forward {
            if !opts.fake {
                self.migrator.forward(target, &ctx, None)?;
            }
            dao.update_succ(&mut tx, target, &opts.operator, opts.fake)?;
        } else {
            if !opts.fake {
                self.migrator.backward(target, &ctx)?;
            }
            dao.delete(&mut tx, target, &opts.operator, opts.fake)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Print the migration history with a computed rollbackable flag.
    /// Returns the number of rows.
    pub fn info(&self, environment: &str) -> Result<usize> {
        let ctx = self.context(environment)?;
        let mut conn = self.connect(&ctx)?;
        let dao = self.dao();
        let histories = dao.get_all_dto(&mut conn)?;

        let mut table = Table::new();
        table.add_row(row!["ver", "name", "type", "state", "rollbackable", "created", "updated"]);
        for hist in &histories {
            let sig = MigrationSignature::new(&hist.ver, Some(hist.name.as_str()));
            let rollbackable = match hist.plan_type.as_str() {
                "schema" | "data" => self
                    .plans
                    .must_by_signature(&sig)
                    .map(|(_, p)| p.is_rollbackable().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                "repeatable" => self
                    .plans
                    .must_repeatable_by_signature(&sig)
                    .map(|p| p.is_rollbackable().to_string())
                    .unwrap_or_else(|_| "unknown".to_string()),
                _ => "false".to_string(),
            };
            table.add_row(row![
                hist.ver,
                hist.name,
                hist.plan_type,
                hist.state.as_str(),
                rollbackable,
                hist.created,
                hist.updated
            ]);
        }
        if !histories.is_empty() {
            info!("Migration history:");
            table.printstd();
        }
        Ok(histories.len())
    }

    /// Verify every plan against the store and the data directory: schema
    /// manifests resolve (and hash correctly outside fast mode), inline SQL
    /// is non-empty, referenced script files exist.
    pub fn check_integrity(&self, fast: bool) -> Result<()> {
        let mode = if fast { VerifyMode::Fast } else { VerifyMode::Full };
        let mut checked = HashSet::new();
        for plan in self.plans.plans() {
            match plan.plan_type {
                MigrationType::Schema => self.check_schema_plan(plan, mode, &mut checked)?,
                MigrationType::Data => self.check_data_plan(plan)?,
                MigrationType::Repeatable => {
                    return Err(Error::Integrity(format!(
                        "repeatable plan in the versioned chain, {}",
                        plan
                    )))
                }
            }
        }
        for plan in self.plans.repeatable_plans() {
            self.check_data_plan(plan)?;
        }
        Ok(())
    }

    fn check_schema_plan(
        &self,
        plan: &MigrationPlan,
        mode: VerifyMode,
        checked: &mut HashSet<String>,
    ) -> Result<()> {
        let forward = plan
            .change
            .forward
            .as_schema()
            .ok_or_else(|| Error::Integrity(format!("forward is missing, {}", plan)))?;
        if checked.insert(forward.id.clone()) {
            self.store.verify(&forward.id, mode)?;
        }
        if plan.is_initial() {
            return Ok(());
        }
        let backward = plan
            .change
            .backward
            .as_ref()
            .and_then(|b| b.as_schema())
            .ok_or_else(|| Error::Integrity(format!("backward is missing, {}", plan)))?;
        if checked.insert(backward.id.clone()) {
            self.store.verify(&backward.id, mode)?;
        }
        Ok(())
    }

    fn check_data_plan(&self, plan: &MigrationPlan) -> Result<()> {
        if plan.is_initial() {
            return Err(Error::Integrity(format!(
                "initial migration plan should not be a data migration, {}",
                plan
            )));
        }
        for step in std::iter::once(&plan.change.forward).chain(plan.change.backward.iter()) {
            let data = step
                .as_data()
                .ok_or_else(|| Error::Integrity(format!("data change is missing, {}", plan)))?;
            if data.kind == DataChangeKind::Sql {
                if data.sql.as_deref().unwrap_or("").is_empty() {
                    return Err(Error::Integrity(format!("sql is empty, {}", plan)));
                }
            } else {
                let file = data.file.as_deref().unwrap_or("");
                if file.is_empty() {
                    return Err(Error::Integrity(format!(
                        "data migration file is empty, {}",
                        plan
                    )));
                }
                if !self.project.data_dir().join(file).exists() {
                    return Err(Error::Integrity(format!(
                        "data migration file not found, file={}, {}",
                        file, plan
                    )));
                }
            }
        }
        Ok(())
    }

    /// Remove (or report, in dry-run mode) store files no plan references.
    pub fn clean_store(&self, dry_run: bool, skip_integrity: bool) -> Result<Vec<String>> {
        if !skip_integrity {
            self.check_integrity(false)?;
        }
        let reachable = self
            .store
            .reachable(&self.plans.plans_of_type(MigrationType::Schema))?;
        let mode = if dry_run { GcMode::DryRun } else { GcMode::Delete };
        self.store.gc(&reachable, mode)
    }

    /// Diff the current schema dir against the latest schema plan and, when
    /// it changed, store the new blobs and emit the next schema plan.
    pub fn make_schema(&self, name: &str, author: &str) -> Result<Option<PathBuf>> {
        let latest = self.plans.latest(None)?;
        let latest_schema = self.plans.latest(Some(MigrationType::Schema))?;
        let previous_id = latest_schema
            .change
            .forward
            .as_schema()
            .ok_or_else(|| Error::Integrity(format!("forward is missing, {}", latest_schema)))?
            .id
            .clone();

        let (sql_files, index_sha1, index_content) = self.project.read_sql_files()?;
        if previous_id == index_sha1 {
            info!("No schema change");
            return Ok(None);
        }
        self.store.write(&index_sha1, &index_content)?;
        for file in &sql_files {
            self.store.write(&file.sha1, &file.content)?;
        }

        let plan = MigrationPlan::new(
            &bump_version(&latest.version)?,
            name,
            author,
            MigrationType::Schema,
            Change {
                forward: ChangeStep::Schema(SchemaChange {
                    id: index_sha1,
                    precheck: None,
                    postcheck: None,
                }),
                backward: Some(ChangeStep::Schema(SchemaChange {
                    id: previous_id,
                    precheck: None,
                    postcheck: None,
                })),
            },
            vec![latest.sig()],
        );
        Ok(Some(plan.save(&self.project.plan_dir())?))
    }

    /// Emit the next data plan with a sample payload for the given kind.
    pub fn make_data(&self, name: &str, kind: DataChangeKind, author: &str) -> Result<PathBuf> {
        let latest = self.plans.latest(None)?;
        let plan = MigrationPlan::new(
            &bump_version(&latest.version)?,
            name,
            author,
            MigrationType::Data,
            Change {
                forward: ChangeStep::Data(sample_data_change(kind, project::SAMPLE_DATA_SQL)),
                backward: None,
            },
            vec![latest.sig()],
        );
        plan.save(&self.project.plan_dir())
    }

    /// Emit a repeatable plan with a sample payload for the given kind.
    pub fn make_repeatable(&self, name: &str, kind: DataChangeKind, author: &str) -> Result<PathBuf> {
        let plan = MigrationPlan::new(
            REPEATABLE_VERSION,
            name,
            author,
            MigrationType::Repeatable,
            Change {
                forward: ChangeStep::Data(sample_data_change(kind, project::SAMPLE_REPEATABLE_SQL)),
                backward: None,
            },
            vec![],
        );
        plan.save(&self.project.plan_dir())
    }

    /// Compare two schema models (HEAD, a stored version, or a live
    /// environment); a difference is an error.
    pub fn diff(&self, left: &str, right: &str, verbose: bool) -> Result<()> {
        if left == right {
            return Ok(());
        }
        let temp = tempfile::tempdir()?;
        let left_dir = temp.path().join("left");
        let right_dir = temp.path().join("right");
        self.dump_schema(left, diff_item_type(left), &left_dir)?;
        self.dump_schema(right, diff_item_type(right), &right_dir)?;

        let args: &[&str] = if verbose {
            &["--color", "-Nr", "-U4", "left", "right"]
        } else {
            &["--recursive", "--brief", "left", "right"]
        };
        let status = Command::new("diff")
            .args(args)
            .current_dir(temp.path())
            .status()
            .map_err(|e| Error::ExternalTool(format!("failed to run diff: {}", e)))?;
        if !status.success() {
            return Err(Error::Usage(format!(
                "difference found between {} and {}",
                left, right
            )));
        }
        Ok(())
    }

    /// Overwrite the schema dir from a live environment or a stored
    /// version, deleting files that vanished.
    pub fn pull(&self, env_or_version: &str) -> Result<()> {
        match diff_item_type(env_or_version) {
            DiffItem::Environment => self.applier.pull(env_or_version, &self.project.schema_dir()),
            DiffItem::Version => {
                let temp = tempfile::tempdir()?;
                self.dump_schema(env_or_version, DiffItem::Version, temp.path())?;
                let schema_dir = self.project.schema_dir();
                let current = Project::sql_files_under(&schema_dir)?;
                let pulled = Project::sql_files_under(temp.path())?;
                for (name, path) in &pulled {
                    let dest = schema_dir.join(name);
                    fs::copy(path, &dest)?;
                    info!("Updated {}", dest.display());
                }
                let keep: HashSet<&String> = pulled.iter().map(|(name, _)| name).collect();
                for (name, path) in &current {
                    if !keep.contains(name) {
                        fs::remove_file(path)?;
                        info!("Deleted {}", path.display());
                    }
                }
                Ok(())
            }
            DiffItem::Head => Err(Error::Usage(format!(
                "invalid argument, {} is neither environment nor version",
                env_or_version
            ))),
        }
    }

    fn dump_schema(&self, arg: &str, item: DiffItem, dump_dir: &Path) -> Result<()> {
        fs::create_dir_all(dump_dir)?;
        match item {
            DiffItem::Head => {
                for (name, path) in Project::sql_files_under(&self.project.schema_dir())? {
                    fs::copy(path, dump_dir.join(name))?;
                }
                Ok(())
            }
            DiffItem::Version => {
                let sig: MigrationSignature = arg.parse()?;
                let (_, plan) = self.plans.must_by_signature(&sig)?;
                if plan.plan_type != MigrationType::Schema {
                    return Err(Error::Usage(format!(
                        "not a schema migration plan, version={}",
                        arg
                    )));
                }
                let forward = plan
                    .change
                    .forward
                    .as_schema()
                    .ok_or_else(|| Error::Integrity(format!("forward is missing, {}", plan)))?;
                self.store.materialize(&forward.id, dump_dir)
            }
            DiffItem::Environment => {
                let env_file = EnvFile::load(&self.project.env_file())?;
                if !env_file.has_section(arg) {
                    return Err(Error::Usage(format!("environment not found, name={}", arg)));
                }
                fs::copy(self.project.env_file(), dump_dir.join(".skeema"))?;
                self.applier.pull(arg, dump_dir)?;
                fs::remove_file(dump_dir.join(".skeema"))?;
                Ok(())
            }
        }
    }

    /// Generate a walk over the plan chain as `"{ver}_{name}"` strings.
    pub fn generate_test_plan(&self, kind: TestKind, walk: &WalkOptions) -> Result<Vec<String>> {
        let generator = TestPlanGenerator::new(self.plans.dependency_graph());
        let idx_walk = match kind {
            TestKind::SimpleForward => generator.simple_forward(),
            TestKind::StepForward => generator.step_forward(),
            TestKind::StepForwardBackward => generator.step_forward_backward(),
            TestKind::Monkey => {
                let start = match walk.start.as_deref().filter(|s| !s.is_empty()) {
                    None => 0,
                    Some(s) => signatures_to_walk(&self.plans, &[s.to_string()])?[0],
                };
                let important = self.parse_node_list(walk.important.as_deref())?;
                let non_important = self.parse_node_list(walk.non_important.as_deref())?;
                generator.monkey(
                    walk.walk_len,
                    start,
                    &important,
                    &non_important,
                    &mut rand::thread_rng(),
                )
            }
            TestKind::Custom => {
                return Err(Error::Usage(
                    "custom test plans are read from a file, not generated".to_string(),
                ))
            }
        };
        walk_to_signatures(&self.plans, &idx_walk)
    }

    fn parse_node_list(&self, raw: Option<&str>) -> Result<Vec<usize>> {
        match raw.filter(|s| !s.is_empty()) {
            None => Ok(Vec::new()),
            Some(raw) => signatures_to_walk(
                &self.plans,
                &raw.split(',').map(|s| s.to_string()).collect::<Vec<_>>(),
            ),
        }
    }

    /// Write a generated test plan to a JSON file.
    pub fn test_gen(&self, kind: TestKind, output: &Path, walk: &WalkOptions) -> Result<()> {
        let plan = self.generate_test_plan(kind, walk)?;
        let plan_str = serde_json::to_string_pretty(&plan)?;
        info!("Test plan:\n{}", plan_str);
        fs::write(output, plan_str + "\n")?;
        info!("Test plan is saved to {}", output.display());
        Ok(())
    }

    /// Drive migrate/rollback through a test plan: each step whose chain
    /// position is above its predecessor migrates, the rest roll back.
    pub fn test_run(
        &self,
        kind: TestKind,
        environment: &str,
        input: &Path,
        clear: bool,
        walk: &WalkOptions,
    ) -> Result<()> {
        let sigs: Vec<String> = if kind == TestKind::Custom {
            serde_json::from_str(&fs::read_to_string(input)?)?
        } else {
            self.generate_test_plan(kind, walk)?
        };
        let steps = signatures_to_walk(&self.plans, &sigs)?;

        if clear {
            self.clear_database(environment)?;
        }

        for (i, &idx) in steps.iter().enumerate() {
            let plan = self
                .plans
                .get(idx)
                .ok_or_else(|| Error::Usage(format!("no migration plan at index {}", idx)))?;
            if i == 0 || idx > steps[i - 1] {
                self.migrate(&MigrateOptions {
                    environment: environment.to_string(),
                    version: Some(plan.version.clone()),
                    name: Some(plan.name.clone()),
                    ..Default::default()
                })?;
            } else {
                self.rollback(&RollbackOptions {
                    environment: environment.to_string(),
                    version: plan.version.clone(),
                    name: Some(plan.name.clone()),
                    ..Default::default()
                })?;
            }
        }
        Ok(())
    }

    /// Drop every table in the environment's schema.
    fn clear_database(&self, environment: &str) -> Result<()> {
        warn!("Clearing database...");
        let ctx = self.context(environment)?;
        let mut conn = db::connect(&ctx.section, &ctx.password)?;
        let mut tx = conn.start_transaction(TxOpts::default())?;
        tx.query_drop("SET FOREIGN_KEY_CHECKS=0")?;
        let tables: Vec<String> = tx.exec(
            "SELECT table_name FROM information_schema.tables WHERE TABLE_SCHEMA = ?",
            (&ctx.section.schema,),
        )?;
        for table in tables {
            tx.query_drop(format!("DROP TABLE `{}`", table))?;
        }
        tx.query_drop("SET FOREIGN_KEY_CHECKS=1")?;
        tx.commit()?;
        warn!("Database cleared");
        Ok(())
    }
}

fn sample_data_change(kind: DataChangeKind, sample_sql: &str) -> DataChange {
    let mut change = DataChange {
        kind,
        sql: None,
        file: None,
        precheck: None,
        postcheck: None,
    };
    match kind {
        DataChangeKind::Sql => change.sql = Some(sample_sql.to_string()),
        DataChangeKind::SqlFile => change.file = Some(project::SAMPLE_SQL_FILE.to_string()),
        DataChangeKind::Python => change.file = Some(project::SAMPLE_PYTHON_FILE.to_string()),
        DataChangeKind::Shell => change.file = Some(project::SAMPLE_SHELL_FILE.to_string()),
        DataChangeKind::Typescript => {
            change.file = Some(project::SAMPLE_TYPESCRIPT_FILE.to_string())
        }
    }
    if let Some(file) = &change.file {
        info!("Create {} under the data directory before migrating", file);
    }
    change
}

fn bump_version(version: &str) -> Result<String> {
    let current: u64 = version
        .parse()
        .map_err(|_| Error::Usage(format!("invalid version {}", version)))?;
    Ok(format!("{:04}", current + 1))
}

fn print_plan_table<'a, I: IntoIterator<Item = &'a MigrationPlan>>(plans: I) {
    let mut table = Table::new();
    table.add_row(row!["ver", "name", "type", "forward", "backward"]);
    for plan in plans {
        table.add_row(row![
            plan.version,
            plan.name,
            plan.plan_type,
            plan.change.forward.display_payload(),
            plan.change
                .backward
                .as_ref()
                .map(|b| b.display_payload())
                .unwrap_or_default()
        ]);
    }
    table.printstd();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_item_type_detection() {
        assert_eq!(diff_item_type("HEAD"), DiffItem::Head);
        assert_eq!(diff_item_type("0002"), DiffItem::Version);
        assert_eq!(diff_item_type("2"), DiffItem::Version);
        assert_eq!(diff_item_type("0002_new_table"), DiffItem::Version);
        assert_eq!(diff_item_type("production"), DiffItem::Environment);
        assert_eq!(diff_item_type("dev_2"), DiffItem::Environment);
    }

    #[test]
    fn test_bump_version_pads() {
        assert_eq!(bump_version("0000").unwrap(), "0001");
        assert_eq!(bump_version("0009").unwrap(), "0010");
        assert!(bump_version("R").is_err());
    }
}
