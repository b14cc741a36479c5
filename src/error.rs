// src/error.rs

use thiserror::Error;

/// Core error types for sdm
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed plan graph, missing/corrupt store blob, or a history table
    /// that no longer matches the plan chain
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// A pre/post condition check returned something other than the
    /// expected value
    #[error("Condition check failed: {0}")]
    ConditionCheckFailed(String),

    /// Invalid target version, ambiguous signature, unknown environment
    #[error("{0}")]
    Usage(String),

    /// A subprocess (schema applier, script runtime) exited non-zero
    #[error("External tool failed: {0}")]
    ExternalTool(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] mysql::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Plan file or snapshot (de)serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using sdm's Error type
pub type Result<T> = std::result::Result<T, Error>;
