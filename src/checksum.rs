// src/checksum.rs

//! SHA-1 helpers for the content-addressed schema store and plan checksums.

use crate::error::Result;
use sha1::{Digest, Sha1};
use std::fs;
use std::path::Path;

/// Incremental SHA-1 accumulator over string fragments and file contents.
pub struct Sha1Helper {
    hasher: Sha1,
}

impl Sha1Helper {
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    /// Feed string fragments into the digest.
    pub fn update_str<S: AsRef<str>>(&mut self, parts: &[S]) {
        for part in parts {
            self.hasher.update(part.as_ref().as_bytes());
        }
    }

    /// Feed whole-file contents into the digest.
    pub fn update_file<P: AsRef<Path>>(&mut self, files: &[P]) -> Result<()> {
        for file in files {
            let data = fs::read(file)?;
            self.hasher.update(&data);
        }
        Ok(())
    }

    /// Finish the digest and return the lowercase hex representation.
    pub fn hexdigest(self) -> String {
        to_hex(&self.hasher.finalize())
    }
}

impl Default for Sha1Helper {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-1 over a list of string fragments, as lowercase hex.
pub fn sha1_hex<S: AsRef<str>>(parts: &[S]) -> String {
    let mut helper = Sha1Helper::new();
    helper.update_str(parts);
    helper.hexdigest()
}

/// Map a hash to its two-level store path, e.g. `"ab/cdef0123…"`.
pub fn rel_path(hash: &str) -> String {
    format!("{}/{}", &hash[..2], &hash[2..])
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Shorten a string for log and table output.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_known_value() {
        // sha1("abc")
        assert_eq!(sha1_hex(&["abc"]), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_sha1_fragments_equal_concatenation() {
        assert_eq!(sha1_hex(&["ab", "c"]), sha1_hex(&["abc"]));
    }

    #[test]
    fn test_update_file_matches_update_str() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "create table t (id int);").unwrap();

        let mut helper = Sha1Helper::new();
        helper.update_file(&[file.path()]).unwrap();

        assert_eq!(helper.hexdigest(), sha1_hex(&["create table t (id int);"]));
    }

    #[test]
    fn test_rel_path_splits_after_two_chars() {
        assert_eq!(
            rel_path("a9993e364706816aba3e25717850c26c9cd0d89d"),
            "a9/993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
