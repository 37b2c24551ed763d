// src/manifest.rs

//! File tree manifests for cache/remote drift detection
//!
//! A manifest maps every relative path under a folder to the MD5 of its
//! contents, plus a creation timestamp. The combined hash (MD5 of the
//! sorted `path: md5` lines joined) is the content identity of the tree:
//! it doubles as the recipe revision for exported recipes.
//!
//! On-disk format (`conanmanifest.txt`): the first line is the
//! timestamp in epoch seconds, each following line is `relative/path: md5hex`.

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Manifest file name inside a manifested folder
pub const MANIFEST_FILE: &str = "conanmanifest.txt";

/// Recursive mapping from relative path to content hash, with a
/// top-level combined hash.
#[derive(Debug, Clone)]
pub struct FileTreeManifest {
    time: i64,
    files: BTreeMap<String, String>,
}

impl FileTreeManifest {
    /// Build a manifest from already-known file digests
    pub fn new(time: i64, files: BTreeMap<String, String>) -> Self {
        Self { time, files }
    }

    /// Compute a manifest by hashing every file under `folder`
    ///
    /// The manifest file itself is excluded. Paths are stored relative
    /// with forward-slash separators so manifests compare identically
    /// across platforms.
    pub fn create(folder: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();

        for entry in WalkDir::new(folder).min_depth(1) {
            let entry = entry.map_err(|e| {
                Error::IoError(format!("Failed to walk {}: {e}", folder.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(folder)
                .map_err(|e| Error::IoError(format!("Bad manifest path: {e}")))?;
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if relative == MANIFEST_FILE {
                continue;
            }

            let digest = hash::hash_file(HashAlgorithm::Md5, entry.path())?;
            files.insert(relative, digest);
        }

        Ok(Self {
            time: Utc::now().timestamp(),
            files,
        })
    }

    /// Load the manifest stored in `folder`
    pub fn load(folder: &Path) -> Result<Self> {
        let path = folder.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    /// Parse manifest text
    pub fn parse(contents: &str) -> Result<Self> {
        let mut lines = contents.lines();
        let time = lines
            .next()
            .ok_or_else(|| Error::ParseError("empty manifest".to_string()))?
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::ParseError(format!("bad manifest timestamp: {e}")))?;

        let mut files = BTreeMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Split on the last separator: paths may contain ": " themselves
            let (path, digest) = line
                .rsplit_once(": ")
                .ok_or_else(|| Error::ParseError(format!("bad manifest line '{}'", line)))?;
            files.insert(path.to_string(), digest.to_string());
        }

        Ok(Self { time, files })
    }

    /// Write the manifest into `folder`
    pub fn save(&self, folder: &Path) -> Result<()> {
        let path = folder.join(MANIFEST_FILE);
        fs::write(&path, self.to_string())
            .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", path.display())))
    }

    /// The sorted `path: md5` lines joined by newlines
    fn file_sums(&self) -> String {
        self.files
            .iter()
            .map(|(path, digest)| format!("{}: {}", path, digest))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// The combined top hash: MD5 over the sorted per-file lines
    pub fn combined_hash(&self) -> String {
        hash::md5(self.file_sums().as_bytes())
    }

    /// Creation timestamp in epoch seconds
    pub fn time(&self) -> i64 {
        self.time
    }

    /// The per-file digests, keyed by relative path
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    /// Number of files covered
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the manifest covers no files
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Manifests compare equal iff their combined hashes match; the
/// timestamp is a freshness signal, not part of the content identity.
impl PartialEq for FileTreeManifest {
    fn eq(&self, other: &Self) -> bool {
        self.combined_hash() == other.combined_hash()
    }
}

impl Eq for FileTreeManifest {}

impl fmt::Display for FileTreeManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.time)?;
        write!(f, "{}", self.file_sums())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sample_tree(dir: &Path) {
        fs::create_dir_all(dir.join("include")).unwrap();
        fs::write(dir.join("recipe.json"), b"{}").unwrap();
        fs::write(dir.join("include/api.h"), b"#pragma once\n").unwrap();
    }

    #[test]
    fn test_create_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let manifest = FileTreeManifest::create(dir.path()).unwrap();
        assert_eq!(manifest.len(), 2);

        manifest.save(dir.path()).unwrap();
        let loaded = FileTreeManifest::load(dir.path()).unwrap();
        assert_eq!(manifest, loaded);
        assert_eq!(manifest.time(), loaded.time());
    }

    #[test]
    fn test_manifest_file_excluded_from_itself() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let before = FileTreeManifest::create(dir.path()).unwrap();
        before.save(dir.path()).unwrap();
        let after = FileTreeManifest::create(dir.path()).unwrap();

        assert_eq!(before, after);
    }

    #[test]
    fn test_content_change_changes_hash() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());
        let original = FileTreeManifest::create(dir.path()).unwrap();

        fs::write(dir.path().join("recipe.json"), b"{\"a\": 1}").unwrap();
        let changed = FileTreeManifest::create(dir.path()).unwrap();

        assert_ne!(original, changed);
        assert_ne!(original.combined_hash(), changed.combined_hash());
    }

    #[test]
    fn test_equality_ignores_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        sample_tree(dir.path());

        let mut a = FileTreeManifest::create(dir.path()).unwrap();
        let b = FileTreeManifest::create(dir.path()).unwrap();
        a.time = b.time() + 100;

        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_format() {
        let text = "1700000000\ninclude/api.h: 0123456789abcdef0123456789abcdef\nrecipe.json: fedcba9876543210fedcba9876543210";
        let manifest = FileTreeManifest::parse(text).unwrap();
        assert_eq!(manifest.time(), 1_700_000_000);
        assert_eq!(manifest.len(), 2);
        assert_eq!(manifest.to_string(), text);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(FileTreeManifest::parse("").is_err());
        assert!(FileTreeManifest::parse("not-a-timestamp\nfoo: bar").is_err());
        assert!(FileTreeManifest::parse("12345\nline-without-separator").is_err());
    }
}
