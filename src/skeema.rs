// src/skeema.rs

//! Wrapper around the external schema applier
//!
//! The DDL engine is skeema, invoked as a subprocess against a directory of
//! schema files. The core only depends on this thin command surface; the
//! binary can be swapped via `SDM_SKEEMA_CMD`.

use crate::error::{Error, Result};
use std::path::Path;
use std::process::Command;
use tracing::info;

pub struct SchemaApplier {
    command: String,
}

impl SchemaApplier {
    pub fn new() -> Self {
        Self {
            command: std::env::var("SDM_SKEEMA_CMD").unwrap_or_else(|_| "skeema".to_string()),
        }
    }

    pub fn with_command(command: &str) -> Self {
        Self {
            command: command.to_string(),
        }
    }

    /// Run the applier with the given arguments, inheriting stdio so the
    /// operator sees its output.
    pub fn run(&self, args: &[&str], cwd: &Path) -> Result<()> {
        info!("Running {} {}", self.command, args.join(" "));
        let status = Command::new(&self.command)
            .args(args)
            .current_dir(cwd)
            .status()
            .map_err(|e| Error::ExternalTool(format!("failed to run {}: {}", self.command, e)))?;
        if !status.success() {
            return Err(Error::ExternalTool(format!(
                "{} {} exited with {}",
                self.command,
                args.join(" "),
                status
            )));
        }
        Ok(())
    }

    /// Apply the schema files under `cwd` to the environment.
    pub fn push(&self, env: &str, allow_unsafe: bool, cwd: &Path) -> Result<()> {
        let mut args = vec!["push", env];
        if allow_unsafe {
            args.push("--allow-unsafe");
        }
        self.run(&args, cwd)
    }

    /// Overwrite the schema files under `cwd` from the environment.
    pub fn pull(&self, env: &str, cwd: &Path) -> Result<()> {
        self.run(&["pull", env], cwd)
    }

    /// Bootstrap the schema dir from a live schema.
    #[allow(clippy::too_many_arguments)]
    pub fn init(
        &self,
        host: &str,
        port: u16,
        user: &str,
        schema: &str,
        schema_dir: &str,
        ignore_table: &str,
        cwd: &Path,
    ) -> Result<()> {
        let port = port.to_string();
        self.run(
            &[
                "init",
                "--host",
                host,
                "--port",
                &port,
                "--user",
                user,
                "--schema",
                schema,
                "-d",
                schema_dir,
                "--ignore-table",
                ignore_table,
            ],
            cwd,
        )
    }

    /// Register another environment section in the `.skeema` file.
    #[allow(clippy::too_many_arguments)]
    pub fn add_environment(
        &self,
        env: &str,
        host: &str,
        port: u16,
        user: &str,
        schema_dir: &str,
        ignore_table: &str,
        cwd: &Path,
    ) -> Result<()> {
        let port = port.to_string();
        self.run(
            &[
                "add-environment",
                env,
                "--host",
                host,
                "--port",
                &port,
                "--user",
                user,
                "-d",
                schema_dir,
                "--ignore-table",
                ignore_table,
            ],
            cwd,
        )
    }
}

impl Default for SchemaApplier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonzero_exit_is_external_tool_error() {
        let applier = SchemaApplier::with_command("false");
        let err = applier.run(&[], &std::env::temp_dir()).unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
    }

    #[test]
    fn test_missing_binary_is_external_tool_error() {
        let applier = SchemaApplier::with_command("sdm-no-such-binary");
        let err = applier.run(&["push"], &std::env::temp_dir()).unwrap_err();
        assert!(matches!(err, Error::ExternalTool(_)));
    }

    #[test]
    fn test_zero_exit_is_ok() {
        let applier = SchemaApplier::with_command("true");
        applier.run(&[], &std::env::temp_dir()).unwrap();
    }
}
