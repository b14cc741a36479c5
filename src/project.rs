// src/project.rs

//! Migration workspace layout
//!
//! A workspace is a directory owned by the tool: plan files, the schema
//! model, the data-migration scripts, and the content-addressed store each
//! live in a fixed subdirectory. The struct replaces ambient configuration
//! with explicit paths passed to whoever needs them.
//!
//! ```text
//! workspace/
//!   migration_plan/   one JSON file per plan
//!   schema/           current schema model + .skeema environment file
//!   data/             user-supplied data migration scripts
//!   schema_store/     content-addressed blobs, XX/ fan-out
//!   .env              MYSQL_PWD for local runs
//! ```

use crate::checksum::sha1_hex;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const PLAN_DIR: &str = "migration_plan";
pub const SCHEMA_DIR: &str = "schema";
pub const DATA_DIR: &str = "data";
pub const STORE_DIR: &str = "schema_store";

/// A schema SQL file with its content hash.
#[derive(Debug, Clone)]
pub struct SqlFile {
    pub name: String,
    pub content: String,
    pub sha1: String,
}

#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
}

impl Project {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn from_cwd() -> Result<Self> {
        Ok(Self::new(std::env::current_dir()?))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn plan_dir(&self) -> PathBuf {
        self.root.join(PLAN_DIR)
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.root.join(SCHEMA_DIR)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join(DATA_DIR)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.root.join(STORE_DIR)
    }

    /// The INI environment file maintained by the schema applier.
    pub fn env_file(&self) -> PathBuf {
        self.schema_dir().join(".skeema")
    }

    /// MYSQL_PWD from the process environment, falling back to the
    /// workspace `.env` file.
    pub fn mysql_pwd(&self) -> String {
        dotenv::from_path(self.root.join(".env")).ok();
        std::env::var("MYSQL_PWD").unwrap_or_default()
    }

    /// Read every `*.sql` file in the schema dir and derive the manifest:
    /// files sorted by content hash, index hash over the concatenated
    /// hashes, one `{hash}:{name}` manifest line per file.
    pub fn read_sql_files(&self) -> Result<(Vec<SqlFile>, String, String)> {
        let mut sql_files = Vec::new();
        for entry in fs::read_dir(self.schema_dir())? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| Error::Integrity(format!("invalid schema file {}", path.display())))?;
            let content = fs::read_to_string(&path)?;
            let sha1 = sha1_hex(&[content.as_str()]);
            sql_files.push(SqlFile { name, content, sha1 });
        }
        sql_files.sort_by(|a, b| a.sha1.cmp(&b.sha1));

        let hashes: Vec<&str> = sql_files.iter().map(|f| f.sha1.as_str()).collect();
        let index_sha1 = sha1_hex(&hashes);
        let index_content = sql_files
            .iter()
            .map(|f| format!("{}:{}", f.sha1, f.name))
            .collect::<Vec<_>>()
            .join("\n");
        Ok((sql_files, index_sha1, index_content))
    }

    /// `*.sql` filenames and paths directly under a directory.
    pub fn sql_files_under(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("sql") {
                if let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) {
                    files.push((name, path));
                }
            }
        }
        Ok(files)
    }

    /// Refuse to initialize over an existing workspace.
    pub fn check_not_initialized(&self) -> Result<()> {
        for path in [
            self.plan_dir(),
            self.schema_dir(),
            self.data_dir(),
            self.store_dir(),
            self.root.join(".gitignore"),
            self.root.join(".env"),
            self.root.join("package.json"),
            self.root.join("tsconfig.json"),
        ] {
            if path.exists() {
                return Err(Error::Usage(format!(
                    "{} already exists, refusing to initialize",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Write the workspace support files created by `init`.
    pub fn scaffold(&self, mysql_pwd: &str) -> Result<()> {
        fs::write(self.root.join(".gitignore"), SAMPLE_GITIGNORE)?;
        fs::write(self.root.join("pre-commit"), SAMPLE_PRE_COMMIT)?;
        fs::write(self.root.join(".env"), format!("MYSQL_PWD={}\n", mysql_pwd))?;
        fs::write(self.root.join("package.json"), SAMPLE_PACKAGE_JSON)?;
        fs::write(self.root.join("tsconfig.json"), SAMPLE_TSCONFIG_JSON)?;
        Ok(())
    }
}

const SAMPLE_GITIGNORE: &str = "\
.env
node_modules/
tmp*/
";

const SAMPLE_PRE_COMMIT: &str = "\
#!/bin/sh
# keep the schema store consistent with the committed plans
sdm check integrity --fast
";

const SAMPLE_PACKAGE_JSON: &str = r#"{
    "name": "sdm-data-migrations",
    "private": true,
    "scripts": {
        "build": "tsc"
    },
    "dependencies": {
        "mysql2": "^3.9.0"
    },
    "devDependencies": {
        "typescript": "^5.4.0"
    }
}
"#;

const SAMPLE_TSCONFIG_JSON: &str = r#"{
    "compilerOptions": {
        "target": "es2020",
        "module": "commonjs",
        "esModuleInterop": true,
        "strict": true
    }
}
"#;

/// Sample payloads written into freshly generated data plans.
pub const SAMPLE_DATA_SQL: &str =
    "INSERT INTO `testtable` (`id`, `name`) VALUES (1, 'foo.bar');";
pub const SAMPLE_REPEATABLE_SQL: &str = "INSERT INTO `testtable` (`id`, `name`) VALUES (1, \
     'foo.bar') ON DUPLICATE KEY UPDATE `name` = 'foo.bar';";

pub const SAMPLE_SQL_FILE: &str = "your_sql_file.sql";
pub const SAMPLE_PYTHON_FILE: &str = "your_python_file.py";
pub const SAMPLE_SHELL_FILE: &str = "your_shell_file.sh";
pub const SAMPLE_TYPESCRIPT_FILE: &str = "your_typescript_file.ts";
