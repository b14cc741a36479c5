// src/plan/mod.rs

//! Migration plan model
//!
//! A plan is a declarative, versioned unit of change with a forward and
//! (usually) a backward side. Schema plans point into the content-addressed
//! schema store; data and repeatable plans carry inline SQL or reference a
//! script under the data directory. Plans are stored one per JSON file in
//! the plan directory and are immutable after creation; the checksum
//! mechanism detects hand edits.

pub mod manager;

use crate::checksum::{truncate_str, Sha1Helper};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::info;

/// Version string shared by every repeatable plan
pub const REPEATABLE_VERSION: &str = "R";

/// Signature of the initial plan every chain starts from
pub fn initial_signature() -> MigrationSignature {
    MigrationSignature {
        version: "0000".to_string(),
        name: Some("init".to_string()),
    }
}

/// Migration flavor. Schema and data plans are versioned and form the
/// ordered chain; repeatable plans re-run whenever their checksum changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    Schema,
    Data,
    Repeatable,
}

impl MigrationType {
    pub fn is_versioned(&self) -> bool {
        matches!(self, MigrationType::Schema | MigrationType::Data)
    }

    pub fn as_str(&self) -> &str {
        match self {
            MigrationType::Schema => "schema",
            MigrationType::Data => "data",
            MigrationType::Repeatable => "repeatable",
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a data change is expressed: inline SQL or a script file under the
/// data directory, dispatched to the matching runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChangeKind {
    Sql,
    SqlFile,
    Python,
    Shell,
    Typescript,
}

impl DataChangeKind {
    /// Whether the payload is a file under the data directory (everything
    /// except inline SQL).
    pub fn is_file_backed(&self) -> bool {
        !matches!(self, DataChangeKind::Sql)
    }

    pub fn as_str(&self) -> &str {
        match self {
            DataChangeKind::Sql => "sql",
            DataChangeKind::SqlFile => "sql_file",
            DataChangeKind::Python => "python",
            DataChangeKind::Shell => "shell",
            DataChangeKind::Typescript => "typescript",
        }
    }
}

impl fmt::Display for DataChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataChangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sql" => Ok(DataChangeKind::Sql),
            "sql_file" => Ok(DataChangeKind::SqlFile),
            "python" => Ok(DataChangeKind::Python),
            "shell" => Ok(DataChangeKind::Shell),
            "typescript" => Ok(DataChangeKind::Typescript),
            _ => Err(Error::Usage(format!("invalid data change type: {}", s))),
        }
    }
}

/// A data change evaluated before or after a migration step. The check's
/// integer result (first column of the first row for SQL, process exit
/// status for scripts) must equal `expected` for the step to proceed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionCheck {
    #[serde(rename = "type")]
    pub kind: DataChangeKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub expected: Option<i64>,
}

/// One direction of a schema plan: a manifest hash in the schema store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub precheck: Option<ConditionCheck>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub postcheck: Option<ConditionCheck>,
}

/// One direction of a data or repeatable plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataChange {
    #[serde(rename = "type")]
    pub kind: DataChangeKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub precheck: Option<ConditionCheck>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub postcheck: Option<ConditionCheck>,
}

/// A single direction of a change. Direction (forward/backward) is plain
/// data on [`Change`]; the variant only distinguishes schema from data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeStep {
    Schema(SchemaChange),
    Data(DataChange),
}

impl ChangeStep {
    pub fn as_schema(&self) -> Option<&SchemaChange> {
        match self {
            ChangeStep::Schema(s) => Some(s),
            ChangeStep::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&DataChange> {
        match self {
            ChangeStep::Schema(_) => None,
            ChangeStep::Data(d) => Some(d),
        }
    }

    pub fn precheck(&self) -> Option<&ConditionCheck> {
        match self {
            ChangeStep::Schema(s) => s.precheck.as_ref(),
            ChangeStep::Data(d) => d.precheck.as_ref(),
        }
    }

    pub fn postcheck(&self) -> Option<&ConditionCheck> {
        match self {
            ChangeStep::Schema(s) => s.postcheck.as_ref(),
            ChangeStep::Data(d) => d.postcheck.as_ref(),
        }
    }

    /// Short payload description for dry-run tables: the manifest hash, a
    /// truncated inline statement, or the script filename.
    pub fn display_payload(&self) -> String {
        match self {
            ChangeStep::Schema(s) => s.id.clone(),
            ChangeStep::Data(d) => match d.kind {
                // truncated to match the length of an index sha1
                DataChangeKind::Sql => truncate_str(d.sql.as_deref().unwrap_or(""), 40),
                _ => d.file.clone().unwrap_or_default(),
            },
        }
    }
}

/// Forward and optional backward side of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub forward: ChangeStep,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub backward: Option<ChangeStep>,
}

/// The `(version, name)` tuple identifying a plan. Versions are zero-padded
/// integer strings, or `"R"` for repeatable plans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MigrationSignature {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
}

impl MigrationSignature {
    pub fn new(version: &str, name: Option<&str>) -> Self {
        Self {
            version: version.to_string(),
            name: name.map(|n| n.to_string()),
        }
    }

    /// Validate version and name against the given plan type (or either
    /// versioned shape when `None`).
    pub fn validate(&self, plan_type: Option<MigrationType>, require_name: bool) -> Result<()> {
        let numeric = self.version.chars().all(|c| c.is_ascii_digit()) && !self.version.is_empty();
        let ok = match plan_type {
            Some(MigrationType::Schema) | Some(MigrationType::Data) => numeric,
            Some(MigrationType::Repeatable) => self.version == REPEATABLE_VERSION,
            None => numeric || self.version == REPEATABLE_VERSION,
        };
        if !ok {
            return Err(Error::Usage(format!("invalid version {}", self.version)));
        }
        match &self.name {
            None if !require_name => Ok(()),
            None => Err(Error::Usage(format!("missing name for version {}", self.version))),
            Some(name) => {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(Error::Usage(format!(
                        "invalid name {}, only alphanumeric and _ allowed",
                        name
                    )));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for MigrationSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.version, self.name.as_deref().unwrap_or(""))
    }
}

impl FromStr for MigrationSignature {
    type Err = Error;

    /// Parse `"{version}_{name}"`; the name part may be empty. Numeric
    /// versions are zero-padded to the canonical width.
    fn from_str(s: &str) -> Result<Self> {
        let mut split = s.splitn(2, '_');
        let version = split
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::Usage(format!("invalid version or name {}", s)))?;
        let name = split.next().filter(|n| !n.is_empty());
        let sig = MigrationSignature::new(&pad_version(version), name);
        sig.validate(None, false)?;
        Ok(sig)
    }
}

/// Zero-pad a numeric version to width 4; non-numeric versions (`"R"`) pass
/// through untouched.
pub fn pad_version(version: &str) -> String {
    if version.chars().all(|c| c.is_ascii_digit()) && !version.is_empty() {
        format!("{:0>4}", version)
    } else {
        version.to_string()
    }
}

/// A declarative migration plan as stored in `{plan_dir}/{ver}_{name}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub version: String,
    pub name: String,
    pub author: String,
    #[serde(rename = "type")]
    pub plan_type: MigrationType,
    pub change: Change,
    pub dependencies: Vec<MigrationSignature>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ignore_after: Option<MigrationSignature>,

    // computed lazily, never written to the plan file
    #[serde(skip, default)]
    checksum: OnceLock<String>,
}

impl PartialEq for MigrationPlan {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
            && self.name == other.name
            && self.author == other.author
            && self.plan_type == other.plan_type
            && self.change == other.change
            && self.dependencies == other.dependencies
            && self.ignore_after == other.ignore_after
    }
}

impl fmt::Display for MigrationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MigrationPlan({}_{})", self.version, self.name)
    }
}

impl MigrationPlan {
    pub fn new(
        version: &str,
        name: &str,
        author: &str,
        plan_type: MigrationType,
        change: Change,
        dependencies: Vec<MigrationSignature>,
    ) -> Self {
        Self {
            version: version.to_string(),
            name: name.to_string(),
            author: author.to_string(),
            plan_type,
            change,
            dependencies,
            ignore_after: None,
            checksum: OnceLock::new(),
        }
    }

    pub fn sig(&self) -> MigrationSignature {
        MigrationSignature::new(&self.version, Some(self.name.as_str()))
    }

    pub fn matches(&self, sig: &MigrationSignature) -> bool {
        self.version == sig.version && Some(self.name.as_str()) == sig.name.as_deref()
    }

    pub fn is_initial(&self) -> bool {
        self.matches(&initial_signature())
    }

    pub fn is_rollbackable(&self) -> bool {
        self.change.backward.is_some()
    }

    /// Canonical sorted-keys JSON of the declared fields, the stable input
    /// for checksumming.
    pub fn canonical_json(&self) -> Result<String> {
        // serde_json maps are BTreeMap-backed, so keys come out sorted
        let value = serde_json::to_value(self)?;
        Ok(serde_json::to_string(&value)?)
    }

    /// SHA-1 over the canonical JSON plus the bytes of any referenced
    /// script files. Computed once and cached.
    pub fn checksum(&self, data_dir: &Path) -> Result<String> {
        if let Some(cached) = self.checksum.get() {
            return Ok(cached.clone());
        }
        let computed = self.compute_checksum(data_dir)?;
        Ok(self.checksum.get_or_init(|| computed).clone())
    }

    fn compute_checksum(&self, data_dir: &Path) -> Result<String> {
        let mut helper = Sha1Helper::new();
        helper.update_str(&[self.canonical_json()?]);
        if matches!(self.plan_type, MigrationType::Data | MigrationType::Repeatable) {
            for step in std::iter::once(&self.change.forward).chain(self.change.backward.iter()) {
                if let Some(data) = step.as_data() {
                    if data.kind.is_file_backed() {
                        if let Some(file) = &data.file {
                            helper.update_file(&[data_dir.join(file)])?;
                        }
                    }
                }
            }
        }
        Ok(helper.hexdigest())
    }

    /// Plan dict plus checksum (and the fake flag when set), serialized for
    /// the history audit log.
    pub fn snapshot_json(&self, data_dir: &Path, fake: bool) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        let map = value
            .as_object_mut()
            .expect("plan always serializes to an object");
        map.insert(
            "checksum".to_string(),
            serde_json::Value::String(self.checksum(data_dir)?),
        );
        if fake {
            map.insert("fake".to_string(), serde_json::Value::Bool(true));
        }
        Ok(serde_json::to_string(&value)?)
    }

    /// Write the plan to `{plan_dir}/{version}_{name}.json`.
    pub fn save(&self, plan_dir: &Path) -> Result<PathBuf> {
        self.sig().validate(Some(self.plan_type), true)?;
        let path = plan_dir.join(format!("{}_{}.json", self.version, self.name));
        fs::write(&path, serde_json::to_string_pretty(self)? + "\n")?;
        info!("Saved migration plan to {}", path.display());
        Ok(path)
    }

    /// Read a single plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let plan: MigrationPlan = serde_json::from_str(&data)?;
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql_data_plan(sql: &str) -> MigrationPlan {
        MigrationPlan::new(
            "0001",
            "seed",
            "tester",
            MigrationType::Data,
            Change {
                forward: ChangeStep::Data(DataChange {
                    kind: DataChangeKind::Sql,
                    sql: Some(sql.to_string()),
                    file: None,
                    precheck: None,
                    postcheck: None,
                }),
                backward: None,
            },
            vec![initial_signature()],
        )
    }

    #[test]
    fn test_signature_display_and_parse() {
        let sig: MigrationSignature = "1_new_test_table".parse().unwrap();
        assert_eq!(sig.version, "0001");
        assert_eq!(sig.name.as_deref(), Some("new_test_table"));
        assert_eq!(sig.to_string(), "0001_new_test_table");

        let bare: MigrationSignature = "0002".parse().unwrap();
        assert!(bare.name.is_none());
    }

    #[test]
    fn test_signature_validation() {
        let sig = MigrationSignature::new("R", Some("seed"));
        assert!(sig.validate(Some(MigrationType::Repeatable), true).is_ok());
        assert!(sig.validate(Some(MigrationType::Schema), true).is_err());

        let bad_name = MigrationSignature::new("0001", Some("has space"));
        assert!(bad_name.validate(None, true).is_err());
    }

    #[test]
    fn test_plan_json_round_trip() {
        let plan = sql_data_plan("INSERT INTO t VALUES (1);");
        let json = serde_json::to_string(&plan).unwrap();
        let back: MigrationPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(plan, back);
        // untagged change step must come back as the data variant
        assert!(back.change.forward.as_data().is_some());
    }

    #[test]
    fn test_schema_step_deserializes_as_schema() {
        let json = r#"{"forward": {"id": "abc123"}}"#;
        let change: Change = serde_json::from_str(json).unwrap();
        assert_eq!(change.forward.as_schema().unwrap().id, "abc123");
    }

    #[test]
    fn test_checksum_depends_on_declared_fields() {
        let dir = tempfile::tempdir().unwrap();
        let a = sql_data_plan("INSERT INTO t VALUES (1);");
        let b = sql_data_plan("INSERT INTO t VALUES (1);");
        let c = sql_data_plan("INSERT INTO t VALUES (2);");
        assert_eq!(a.checksum(dir.path()).unwrap(), b.checksum(dir.path()).unwrap());
        assert_ne!(a.checksum(dir.path()).unwrap(), c.checksum(dir.path()).unwrap());
    }

    #[test]
    fn test_checksum_includes_referenced_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seed.sql"), "INSERT INTO t VALUES (1);").unwrap();

        let file_plan = || {
            let mut plan = sql_data_plan("");
            plan.change.forward = ChangeStep::Data(DataChange {
                kind: DataChangeKind::SqlFile,
                sql: None,
                file: Some("seed.sql".to_string()),
                precheck: None,
                postcheck: None,
            });
            plan
        };
        let original = file_plan();
        let before = original.checksum(dir.path()).unwrap();

        std::fs::write(dir.path().join("seed.sql"), "INSERT INTO t VALUES (2);").unwrap();
        let after = file_plan().checksum(dir.path()).unwrap();
        assert_ne!(before, after);

        // the first computation is cached on the original instance
        assert_eq!(original.checksum(dir.path()).unwrap(), before);
    }

    #[test]
    fn test_snapshot_json_carries_checksum_and_fake() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sql_data_plan("INSERT INTO t VALUES (1);");
        let snapshot: serde_json::Value =
            serde_json::from_str(&plan.snapshot_json(dir.path(), true).unwrap()).unwrap();
        assert_eq!(snapshot["checksum"].as_str().unwrap(), plan.checksum(dir.path()).unwrap());
        assert_eq!(snapshot["fake"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let plan = sql_data_plan("INSERT INTO t VALUES (1);");
        let path = plan.save(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "0001_seed.json");
        let back = MigrationPlan::load(&path).unwrap();
        assert_eq!(plan, back);
    }

    #[test]
    fn test_display_payload_truncates_inline_sql() {
        let long_sql = "INSERT INTO `testtable` (`id`, `name`) VALUES (1, 'some very long value');";
        let plan = sql_data_plan(long_sql);
        let shown = plan.change.forward.display_payload();
        assert_eq!(shown.len(), 43);
        assert!(shown.ends_with("..."));
    }
}
