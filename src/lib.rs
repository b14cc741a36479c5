// src/lib.rs

//! sdm — schema and data migration for MySQL/MariaDB
//!
//! Manages a database's evolution through an ordered chain of declarative
//! migration plans, recorded in a history table inside the target schema.
//!
//! # Architecture
//!
//! - Plans-first: one JSON file per migration, forward and backward
//! - Content-addressed store: schema snapshots as SHA-1 indexed blobs
//! - Two-phase history: PROCESSING/ROLLBACKING rows anchor crash recovery
//! - Repeatable migrations: checksum-gated re-execution on every migrate
//! - External applier: DDL delegated to skeema over a subprocess contract

pub mod checksum;
pub mod db;
pub mod engine;
pub mod environment;
mod error;
pub mod migrator;
pub mod plan;
pub mod project;
pub mod skeema;
pub mod store;
pub mod testplan;

pub use error::{Error, Result};
