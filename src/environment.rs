// src/environment.rs

//! Per-environment database parameters
//!
//! Environments live in the INI-style `.skeema` file inside the schema
//! directory: one section per environment with `host`, `port`, `user`, and
//! `schema` keys. Keys in the preamble (before any section header) act as
//! defaults for every section, matching how the schema applier reads the
//! same file.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Environment variables of the subprocess contract for script-driven data
/// migrations.
pub const ENV_SDM_DATA_DIR: &str = "SDM_DATA_DIR";
pub const ENV_SDM_EXPECTED: &str = "SDM_EXPECTED";
pub const ENV_SDM_CHECKSUM_MATCH: &str = "SDM_CHECKSUM_MATCH";

/// Connection parameters for one environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub schema: String,
}

impl EnvSection {
    /// Variable map injected into shell/python/typescript migration
    /// subprocesses.
    pub fn subprocess_env(&self, password: &str, data_dir: &Path) -> Vec<(String, String)> {
        vec![
            ("MYSQL_PWD".to_string(), password.to_string()),
            ("HOST".to_string(), self.host.clone()),
            ("PORT".to_string(), self.port.to_string()),
            ("USER".to_string(), self.user.clone()),
            ("SCHEMA".to_string(), self.schema.clone()),
            (
                ENV_SDM_DATA_DIR.to_string(),
                data_dir.to_string_lossy().to_string(),
            ),
        ]
    }
}

/// Parsed environment file.
pub struct EnvFile {
    defaults: HashMap<String, String>,
    sections: HashMap<String, HashMap<String, String>>,
}

impl EnvFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Usage(format!("environment file not found: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut defaults = HashMap::new();
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let (key, value) = (key.trim().to_string(), value.trim().to_string());
                match &current {
                    Some(section) => {
                        sections.entry(section.clone()).or_default().insert(key, value);
                    }
                    None => {
                        defaults.insert(key, value);
                    }
                }
            }
        }
        Self { defaults, sections }
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sections.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Resolve one environment, merging preamble defaults under its own
    /// keys.
    pub fn section(&self, name: &str) -> Result<EnvSection> {
        let section = self
            .sections
            .get(name)
            .ok_or_else(|| Error::Usage(format!("environment not found, name={}", name)))?;
        let get = |key: &str| -> Option<&String> { section.get(key).or_else(|| self.defaults.get(key)) };

        let port = match get("port") {
            None => 3306,
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| Error::Usage(format!("invalid port {} for environment {}", raw, name)))?,
        };
        Ok(EnvSection {
            host: get("host").cloned().unwrap_or_else(|| "127.0.0.1".to_string()),
            port,
            user: get("user").cloned().unwrap_or_else(|| "root".to_string()),
            schema: get("schema")
                .cloned()
                .ok_or_else(|| Error::Usage(format!("missing schema for environment {}", name)))?,
        })
    }
}
