// src/db/history.rs

//! Migration history DAO
//!
//! All mutating operations and the locking reads take an explicit
//! [`mysql::Transaction`] opened by the caller; every selection uses
//! `FOR UPDATE` so a second migration process blocks on the same rows
//! instead of interleaving. Each mutation appends a row to the audit log
//! with a JSON snapshot of the plan involved.

use crate::db::TableNames;
use crate::error::{Error, Result};
use crate::plan::{MigrationPlan, MigrationSignature};
use chrono::NaiveDateTime;
use mysql::prelude::Queryable;
use mysql::{Row, Transaction};
use std::path::PathBuf;

/// History row state machine:
/// `[new] -> PROCESSING -> SUCCESSFUL -> ROLLBACKING -> [deleted]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Processing,
    Successful,
    Rollbacking,
}

impl MigrationState {
    pub fn as_str(&self) -> &str {
        match self {
            MigrationState::Processing => "PROCESSING",
            MigrationState::Successful => "SUCCESSFUL",
            MigrationState::Rollbacking => "ROLLBACKING",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "PROCESSING" => Ok(MigrationState::Processing),
            "SUCCESSFUL" => Ok(MigrationState::Successful),
            "ROLLBACKING" => Ok(MigrationState::Rollbacking),
            _ => Err(Error::Integrity(format!("unknown migration state {}", s))),
        }
    }
}

/// Audit-log operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOperation {
    Create,
    Delete,
    UpdateSucc,
    UpdateRollback,
    /// Only for repeatable migrations being retried or re-run
    UpdateProcessing,
}

impl HistoryOperation {
    pub fn as_str(&self) -> &str {
        match self {
            HistoryOperation::Create => "create",
            HistoryOperation::Delete => "delete",
            HistoryOperation::UpdateSucc => "update_succ",
            HistoryOperation::UpdateRollback => "update_rollback",
            HistoryOperation::UpdateProcessing => "update_processing",
        }
    }
}

/// One row of the migration history table.
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    pub id: i64,
    pub ver: String,
    pub name: String,
    pub plan_type: String,
    pub state: MigrationState,
    pub created: NaiveDateTime,
    pub updated: NaiveDateTime,
    pub checksum: String,
}

impl MigrationHistory {
    pub fn can_match(&self, ver: &str, name: &str, checksum: &str) -> bool {
        self.ver == ver && self.name == name && self.checksum == checksum
    }

    fn from_row(row: Row) -> Result<Self> {
        let (id, ver, name, plan_type, state, created, updated, checksum): (
            i64,
            String,
            String,
            String,
            String,
            NaiveDateTime,
            NaiveDateTime,
            String,
        ) = mysql::from_row_opt(row)
            .map_err(|e| Error::Integrity(format!("unexpected history row: {}", e)))?;
        Ok(Self {
            id,
            ver,
            name,
            plan_type,
            state: MigrationState::parse(&state)?,
            created,
            updated,
            checksum,
        })
    }
}

const COLUMNS: &str = "id, ver, name, type, state, created, updated, checksum";
const VERSIONED_CRITERION: &str = "type IN ('schema', 'data')";

pub struct HistoryDao {
    tables: TableNames,
    data_dir: PathBuf,
}

impl HistoryDao {
    pub fn new(tables: TableNames, data_dir: PathBuf) -> Self {
        Self { tables, data_dir }
    }

    /// Insert a new `PROCESSING` row for the plan and log the creation.
    pub fn add_one(
        &self,
        tx: &mut Transaction<'_>,
        plan: &MigrationPlan,
        operator: &str,
        fake: bool,
    ) -> Result<()> {
        tx.exec_drop(
            format!(
                "INSERT INTO `{}` (ver, name, type, state, checksum) VALUES (?, ?, ?, ?, ?)",
                self.tables.history
            ),
            (
                &plan.version,
                &plan.name,
                plan.plan_type.as_str(),
                MigrationState::Processing.as_str(),
                plan.checksum(&self.data_dir)?,
            ),
        )?;
        let hist_id = tx.last_insert_id().unwrap_or(0);
        self.append_log(tx, hist_id, HistoryOperation::Create, plan, operator, fake)
    }

    pub fn update_processing(
        &self,
        tx: &mut Transaction<'_>,
        plan: &MigrationPlan,
        operator: &str,
    ) -> Result<()> {
        self.update(tx, plan, MigrationState::Processing, HistoryOperation::UpdateProcessing, operator, false)
    }

    pub fn update_succ(
        &self,
        tx: &mut Transaction<'_>,
        plan: &MigrationPlan,
        operator: &str,
        fake: bool,
    ) -> Result<()> {
        self.update(tx, plan, MigrationState::Successful, HistoryOperation::UpdateSucc, operator, fake)
    }

    pub fn update_rollback(
        &self,
        tx: &mut Transaction<'_>,
        plan: &MigrationPlan,
        operator: &str,
        fake: bool,
    ) -> Result<()> {
        self.update(tx, plan, MigrationState::Rollbacking, HistoryOperation::UpdateRollback, operator, fake)
    }

    fn update(
        &self,
        tx: &mut Transaction<'_>,
        plan: &MigrationPlan,
        state: MigrationState,
        operation: HistoryOperation,
        operator: &str,
        fake: bool,
    ) -> Result<()> {
        let id = self.lock_row(tx, plan)?;
        tx.exec_drop(
            format!("UPDATE `{}` SET state = ?, checksum = ? WHERE id = ?", self.tables.history),
            (state.as_str(), plan.checksum(&self.data_dir)?, id),
        )?;
        self.append_log(tx, id as u64, operation, plan, operator, fake)
    }

    /// Delete the plan's row and log the deletion.
    pub fn delete(
        &self,
        tx: &mut Transaction<'_>,
        plan: &MigrationPlan,
        operator: &str,
        fake: bool,
    ) -> Result<()> {
        let id = self.lock_row(tx, plan)?;
        tx.exec_drop(
            format!("DELETE FROM `{}` WHERE id = ?", self.tables.history),
            (id,),
        )?;
        self.append_log(tx, id as u64, HistoryOperation::Delete, plan, operator, fake)
    }

    fn lock_row(&self, tx: &mut Transaction<'_>, plan: &MigrationPlan) -> Result<i64> {
        let id: Option<i64> = tx.exec_first(
            format!(
                "SELECT id FROM `{}` WHERE ver = ? AND name = ? FOR UPDATE",
                self.tables.history
            ),
            (&plan.version, &plan.name),
        )?;
        id.ok_or_else(|| {
            Error::Integrity(format!(
                "migration history not found, version={}, name={}",
                plan.version, plan.name
            ))
        })
    }

    fn append_log(
        &self,
        tx: &mut Transaction<'_>,
        hist_id: u64,
        operation: HistoryOperation,
        plan: &MigrationPlan,
        operator: &str,
        fake: bool,
    ) -> Result<()> {
        tx.exec_drop(
            format!(
                "INSERT INTO `{}` (hist_id, operation, operator, snapshot) VALUES (?, ?, ?, ?)",
                self.tables.log
            ),
            (
                hist_id,
                operation.as_str(),
                operator,
                plan.snapshot_json(&self.data_dir, fake)?,
            ),
        )?;
        Ok(())
    }

    pub fn get_all(&self, tx: &mut Transaction<'_>) -> Result<Vec<MigrationHistory>> {
        self.select(
            tx,
            &format!(
                "SELECT {} FROM `{}` ORDER BY id ASC FOR UPDATE",
                COLUMNS, self.tables.history
            ),
        )
    }

    pub fn get_all_versioned(&self, tx: &mut Transaction<'_>) -> Result<Vec<MigrationHistory>> {
        self.select(
            tx,
            &format!(
                "SELECT {} FROM `{}` WHERE {} ORDER BY id ASC FOR UPDATE",
                COLUMNS, self.tables.history, VERSIONED_CRITERION
            ),
        )
    }

    pub fn get_latest(&self, tx: &mut Transaction<'_>) -> Result<Option<MigrationHistory>> {
        self.select_first(
            tx,
            &format!(
                "SELECT {} FROM `{}` ORDER BY id DESC LIMIT 1 FOR UPDATE",
                COLUMNS, self.tables.history
            ),
        )
    }

    pub fn get_latest_versioned(&self, tx: &mut Transaction<'_>) -> Result<Option<MigrationHistory>> {
        self.select_first(
            tx,
            &format!(
                "SELECT {} FROM `{}` WHERE {} ORDER BY id DESC LIMIT 1 FOR UPDATE",
                COLUMNS, self.tables.history, VERSIONED_CRITERION
            ),
        )
    }

    pub fn get_by_sig(
        &self,
        tx: &mut Transaction<'_>,
        sig: &MigrationSignature,
    ) -> Result<Option<MigrationHistory>> {
        let row: Option<Row> = tx.exec_first(
            format!(
                "SELECT {} FROM `{}` WHERE ver = ? AND name = ? FOR UPDATE",
                COLUMNS, self.tables.history
            ),
            (&sig.version, sig.name.as_deref().unwrap_or("")),
        )?;
        row.map(MigrationHistory::from_row).transpose()
    }

    /// Lock-free snapshot of the whole table for read-only reporting; works
    /// on a plain connection outside any transaction.
    pub fn get_all_dto<Q: Queryable>(&self, queryable: &mut Q) -> Result<Vec<MigrationHistory>> {
        let rows: Vec<Row> = queryable.query(format!(
            "SELECT {} FROM `{}` ORDER BY id ASC",
            COLUMNS, self.tables.history
        ))?;
        rows.into_iter().map(MigrationHistory::from_row).collect()
    }

    /// Lock-free lookup by signature, for the repeatable scheduler's gating
    /// reads.
    pub fn get_by_sig_dto<Q: Queryable>(
        &self,
        queryable: &mut Q,
        sig: &MigrationSignature,
    ) -> Result<Option<MigrationHistory>> {
        let row: Option<Row> = queryable.exec_first(
            format!(
                "SELECT {} FROM `{}` WHERE ver = ? AND name = ?",
                COLUMNS, self.tables.history
            ),
            (&sig.version, sig.name.as_deref().unwrap_or("")),
        )?;
        row.map(MigrationHistory::from_row).transpose()
    }

    fn select(&self, tx: &mut Transaction<'_>, sql: &str) -> Result<Vec<MigrationHistory>> {
        let rows: Vec<Row> = tx.query(sql)?;
        rows.into_iter().map(MigrationHistory::from_row).collect()
    }

    fn select_first(&self, tx: &mut Transaction<'_>, sql: &str) -> Result<Option<MigrationHistory>> {
        let row: Option<Row> = tx.query_first(sql)?;
        row.map(MigrationHistory::from_row).transpose()
    }
}
