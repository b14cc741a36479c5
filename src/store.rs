// src/store.rs

//! Content-addressed schema store
//!
//! SQL source files and the manifests that group them live under
//! `{root}/{hash[..2]}/{hash[2..]}`. A source blob is the raw file content
//! (hash = SHA-1 of the content); a manifest blob is one
//! `{source_hash}:{filename}` line per file (hash = SHA-1 of the
//! concatenated source hashes in ascending order). Blobs are written once
//! and never mutated, so concurrent writers are safe by construction.

use crate::checksum::{rel_path, sha1_hex, Sha1Helper};
use crate::error::{Error, Result};
use crate::plan::MigrationPlan;
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Placeholder file kept in every fan-out directory so the layout survives
/// in version control
const PLACEHOLDER: &str = ".gitkeep";

/// One line of a manifest blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub hash: String,
    pub filename: String,
}

/// Verification depth for store blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    /// Path existence only
    Fast,
    /// Recompute every SHA-1
    Full,
}

/// Whether garbage collection deletes or only reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcMode {
    DryRun,
    Delete,
}

pub struct SchemaStore {
    root: PathBuf,
}

impl SchemaStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    /// Absolute path of the blob for `hash`.
    pub fn path_for(&self, hash: &str) -> PathBuf {
        self.root.join(rel_path(hash))
    }

    /// Create the 256 two-hex-digit fan-out directories, each with a
    /// placeholder file.
    pub fn init_layout(&self) -> Result<()> {
        for i in 0..256u16 {
            let dir = self.root.join(format!("{:02x}", i));
            fs::create_dir_all(&dir)?;
            fs::write(dir.join(PLACEHOLDER), "")?;
        }
        Ok(())
    }

    /// Write a blob. An existing blob is left untouched (content-addressing
    /// makes collisions equivalent); new blobs land atomically via a temp
    /// file rename.
    pub fn write(&self, hash: &str, content: &str) -> Result<()> {
        let path = self.path_for(hash);
        if path.exists() {
            return Ok(());
        }
        let dir = path
            .parent()
            .ok_or_else(|| Error::Integrity(format!("invalid store path for hash {}", hash)))?;
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(&path)
            .map_err(|e| Error::Io(e.error))?;
        debug!("Wrote schema store file to {}", path.display());
        Ok(())
    }

    /// Parse a manifest blob into `(source_hash, filename)` pairs,
    /// preserving file order.
    pub fn read_manifest(&self, hash: &str) -> Result<Vec<ManifestEntry>> {
        let path = self.path_for(hash);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Integrity(format!("index file not found, missing file: {}", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let (entry_hash, filename) = line.split_once(':').ok_or_else(|| {
                Error::Integrity(format!("malformed manifest line {:?} in {}", line, path.display()))
            })?;
            entries.push(ManifestEntry {
                hash: entry_hash.to_string(),
                filename: filename.trim().to_string(),
            });
        }
        Ok(entries)
    }

    /// Copy every source file referenced by the manifest into `dest_dir`
    /// under its original filename.
    pub fn materialize(&self, hash: &str, dest_dir: &Path) -> Result<()> {
        for entry in self.read_manifest(hash)? {
            let source = self.path_for(&entry.hash);
            if !source.exists() {
                return Err(Error::Integrity(format!(
                    "sql file not found, id={}, original filename={}",
                    entry.hash, entry.filename
                )));
            }
            fs::copy(&source, dest_dir.join(&entry.filename))?;
        }
        Ok(())
    }

    /// Check that the manifest and every source blob it names resolve; in
    /// full mode also recompute all SHA-1s.
    pub fn verify(&self, hash: &str, mode: VerifyMode) -> Result<()> {
        let entries = self.read_manifest(hash)?;
        if mode == VerifyMode::Full {
            let source_hashes: Vec<&str> = entries.iter().map(|e| e.hash.as_str()).collect();
            let actual = sha1_hex(&source_hashes);
            if actual != hash {
                return Err(Error::Integrity(format!(
                    "schema index sha1 not match, actual_sha1={}, expected_sha1={}",
                    actual, hash
                )));
            }
        }
        for entry in &entries {
            let path = self.path_for(&entry.hash);
            if !path.exists() {
                return Err(Error::Integrity(format!(
                    "sql file not found, id={}, original filename={}",
                    entry.hash, entry.filename
                )));
            }
            if mode == VerifyMode::Full {
                let mut helper = Sha1Helper::new();
                helper.update_file(&[&path])?;
                let actual = helper.hexdigest();
                if actual != entry.hash {
                    return Err(Error::Integrity(format!(
                        "sql file SHA1 not match, original filename={}, expected_sha1={}, actual_sha1={}, file={}",
                        entry.filename,
                        entry.hash,
                        actual,
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every hash reachable from the given schema plans: forward and
    /// backward manifest ids plus all source hashes they name.
    pub fn reachable(&self, schema_plans: &[&MigrationPlan]) -> Result<HashSet<String>> {
        let mut manifest_hashes = HashSet::new();
        for plan in schema_plans {
            if let Some(schema) = plan.change.forward.as_schema() {
                manifest_hashes.insert(schema.id.clone());
            }
            if let Some(schema) = plan.change.backward.as_ref().and_then(|b| b.as_schema()) {
                manifest_hashes.insert(schema.id.clone());
            }
        }
        let mut reachable = HashSet::new();
        for hash in &manifest_hashes {
            for entry in self.read_manifest(hash)? {
                reachable.insert(entry.hash);
            }
        }
        reachable.extend(manifest_hashes);
        Ok(reachable)
    }

    /// Walk the store and delete (or, in dry-run mode, report) every file
    /// whose relative path does not belong to a reachable hash. Placeholder
    /// files are always kept.
    pub fn gc(&self, reachable: &HashSet<String>, mode: GcMode) -> Result<Vec<String>> {
        let valid_paths: HashSet<String> = reachable.iter().map(|h| rel_path(h)).collect();
        let mut unexpected = Vec::new();
        for path in self.all_files()? {
            if valid_paths.contains(&path) {
                continue;
            }
            let full_path = self.root.join(&path);
            match mode {
                GcMode::DryRun => warn!("Unexpected file: {}", full_path.display()),
                GcMode::Delete => {
                    fs::remove_file(&full_path)?;
                    warn!("Deleted {}", full_path.display());
                }
            }
            unexpected.push(path);
        }
        unexpected.sort();
        Ok(unexpected)
    }

    /// Relative paths of all non-placeholder files under the store root.
    fn all_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() {
                for inner in fs::read_dir(entry.path())? {
                    let inner = inner?;
                    let inner_name = inner.file_name().to_string_lossy().to_string();
                    if inner.file_type()?.is_file() && inner_name != PLACEHOLDER {
                        files.push(format!("{}/{}", name, inner_name));
                    }
                }
            } else if name != PLACEHOLDER {
                files.push(name);
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::sha1_hex;

    fn store_with_manifest() -> (tempfile::TempDir, SchemaStore, String, Vec<String>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());

        let contents = ["create table a (id int);", "create table b (id int);"];
        let mut sources: Vec<(String, String, &str)> = contents
            .iter()
            .enumerate()
            .map(|(i, c)| (sha1_hex(&[c]), format!("table_{}.sql", i), *c))
            .collect();
        sources.sort_by(|a, b| a.0.cmp(&b.0));

        let source_hashes: Vec<String> = sources.iter().map(|(h, _, _)| h.clone()).collect();
        let index_hash = sha1_hex(&source_hashes);
        let index_content = sources
            .iter()
            .map(|(h, name, _)| format!("{}:{}", h, name))
            .collect::<Vec<_>>()
            .join("\n");

        store.write(&index_hash, &index_content).unwrap();
        for (hash, _, content) in &sources {
            store.write(hash, content).unwrap();
        }
        (dir, store, index_hash, source_hashes)
    }

    #[test]
    fn test_write_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        let hash = sha1_hex(&["hello"]);
        store.write(&hash, "hello").unwrap();
        store.write(&hash, "ignored, blob already present").unwrap();
        assert_eq!(std::fs::read_to_string(store.path_for(&hash)).unwrap(), "hello");
    }

    #[test]
    fn test_read_manifest_preserves_order() {
        let (_dir, store, index_hash, source_hashes) = store_with_manifest();
        let entries = store.read_manifest(&index_hash).unwrap();
        assert_eq!(entries.len(), 2);
        let got: Vec<String> = entries.iter().map(|e| e.hash.clone()).collect();
        assert_eq!(got, source_hashes);
    }

    #[test]
    fn test_missing_manifest_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        let err = store.read_manifest(&sha1_hex(&["nope"])).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_materialize_copies_under_original_names() {
        let (_dir, store, index_hash, _) = store_with_manifest();
        let dest = tempfile::tempdir().unwrap();
        store.materialize(&index_hash, dest.path()).unwrap();
        assert!(dest.path().join("table_0.sql").exists());
        assert!(dest.path().join("table_1.sql").exists());
    }

    #[test]
    fn test_verify_full_detects_tampered_source() {
        let (_dir, store, index_hash, source_hashes) = store_with_manifest();
        store.verify(&index_hash, VerifyMode::Full).unwrap();

        std::fs::write(store.path_for(&source_hashes[0]), "tampered").unwrap();
        // fast mode only checks existence
        store.verify(&index_hash, VerifyMode::Fast).unwrap();
        let err = store.verify(&index_hash, VerifyMode::Full).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn test_verify_detects_deleted_source() {
        let (_dir, store, index_hash, source_hashes) = store_with_manifest();
        std::fs::remove_file(store.path_for(&source_hashes[1])).unwrap();
        let err = store.verify(&index_hash, VerifyMode::Fast).unwrap_err();
        assert!(err.to_string().contains(&source_hashes[1]));
    }

    #[test]
    fn test_gc_reports_then_deletes_unreachable() {
        let (dir, store, index_hash, source_hashes) = store_with_manifest();
        std::fs::write(dir.path().join("foo"), "bar").unwrap();
        std::fs::create_dir_all(dir.path().join("00")).unwrap();
        std::fs::write(dir.path().join("00/11"), "22").unwrap();
        std::fs::write(dir.path().join("00/.gitkeep"), "").unwrap();

        let mut reachable: HashSet<String> = source_hashes.iter().cloned().collect();
        reachable.insert(index_hash);

        let reported = store.gc(&reachable, GcMode::DryRun).unwrap();
        assert_eq!(reported, vec!["00/11".to_string(), "foo".to_string()]);
        assert!(dir.path().join("foo").exists());

        let deleted = store.gc(&reachable, GcMode::Delete).unwrap();
        assert_eq!(deleted, reported);
        assert!(!dir.path().join("foo").exists());
        assert!(!dir.path().join("00/11").exists());
        assert!(dir.path().join("00/.gitkeep").exists());

        // second pass removes nothing further and keeps referenced blobs
        assert!(store.gc(&reachable, GcMode::Delete).unwrap().is_empty());
        for hash in &reachable {
            assert!(store.path_for(hash).exists());
        }
    }

    #[test]
    fn test_init_layout_creates_fanout_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = SchemaStore::new(dir.path());
        store.init_layout().unwrap();
        assert!(dir.path().join("00/.gitkeep").exists());
        assert!(dir.path().join("ff/.gitkeep").exists());
    }
}
