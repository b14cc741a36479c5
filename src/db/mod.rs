// src/db/mod.rs

//! Database layer for sdm
//!
//! Builds connections to the target MySQL/MariaDB schema and owns the DDL
//! for the two tables the tool keeps inside it: the migration history and
//! its append-only audit log. Everything else in the target schema belongs
//! to the application.

pub mod history;

use crate::environment::EnvSection;
use crate::error::Result;
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};
use tracing::debug;

pub const DEFAULT_HISTORY_TABLE: &str = "_migration_history";
pub const DEFAULT_HISTORY_LOG_TABLE: &str = "_migration_history_log";

/// Names of the tool-owned tables in the target schema.
#[derive(Debug, Clone)]
pub struct TableNames {
    pub history: String,
    pub log: String,
}

impl Default for TableNames {
    fn default() -> Self {
        Self {
            history: DEFAULT_HISTORY_TABLE.to_string(),
            log: DEFAULT_HISTORY_LOG_TABLE.to_string(),
        }
    }
}

/// Open a connection to the environment's schema.
pub fn connect(section: &EnvSection, password: &str) -> Result<Conn> {
    debug!(
        "Connecting to mysql://{}@{}:{}/{}",
        section.user, section.host, section.port, section.schema
    );
    let opts = OptsBuilder::new()
        .ip_or_hostname(Some(section.host.clone()))
        .tcp_port(section.port)
        .user(Some(section.user.clone()))
        .pass(Some(password.to_string()))
        .db_name(Some(section.schema.clone()));
    Ok(Conn::new(opts)?)
}

/// Create the history and audit-log tables when absent. Idempotent.
pub fn ensure_tables(conn: &mut Conn, tables: &TableNames) -> Result<()> {
    conn.query_drop(format!(
        "CREATE TABLE IF NOT EXISTS `{}` (
            id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
            ver VARCHAR(255) NOT NULL,
            name VARCHAR(255) NOT NULL,
            type VARCHAR(255) NOT NULL,
            state ENUM('PROCESSING','SUCCESSFUL','ROLLBACKING') NOT NULL,
            created DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP ON UPDATE CURRENT_TIMESTAMP,
            checksum VARCHAR(255) NOT NULL DEFAULT '',
            UNIQUE KEY uniq_ver_name (ver, name)
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
        tables.history
    ))?;
    conn.query_drop(format!(
        "CREATE TABLE IF NOT EXISTS `{}` (
            id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
            hist_id BIGINT NOT NULL,
            operation VARCHAR(255) NOT NULL,
            snapshot TEXT,
            operator VARCHAR(255) NOT NULL DEFAULT '',
            created DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        ) ENGINE=InnoDB DEFAULT CHARSET=utf8mb4 COLLATE=utf8mb4_unicode_ci",
        tables.log
    ))?;
    Ok(())
}
