// src/download/cached.rs

//! Fingerprint-keyed download cache
//!
//! Immutable fetches (a revision-qualified URL plus a checksum uniquely
//! identify the bytes) are keyed by `sha256(url || checksum)` and served
//! from a local cache directory. Each fingerprint entry is populated
//! under its own cross-process/cross-thread exclusive lock using the
//! dirty-bit protocol: set the bit, download, clear the bit. A hit is
//! copied to the destination, never moved, so the cache keeps its copy.
//!
//! Callers without a checksum cannot rely on immutability and fall
//! through to the plain downloader.

use crate::cache::layout::{clean_dirty, is_dirty, set_dirty};
use crate::error::{Error, Result};
use crate::hash;
use crate::lock::ResourceLocks;
use crate::progress::ProgressTracker;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use super::{DownloadOptions, FileDownloader};

/// Downloader layered over a per-fingerprint filesystem cache
pub struct CachingDownloader {
    downloader: FileDownloader,
    cache_dir: PathBuf,
    locks: Arc<ResourceLocks>,
}

impl CachingDownloader {
    /// Create a caching downloader storing entries under `cache_dir`
    pub fn new(cache_dir: impl Into<PathBuf>, locks: Arc<ResourceLocks>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir).map_err(|e| {
            Error::IoError(format!("Failed to create {}: {e}", cache_dir.display()))
        })?;
        Ok(Self {
            downloader: FileDownloader::new()?,
            cache_dir,
            locks,
        })
    }

    /// The cache key for a URL + checksum pair
    pub fn fingerprint(url: &str, options: &DownloadOptions) -> String {
        let checksum = options
            .sha256
            .as_deref()
            .or(options.sha1.as_deref())
            .or(options.md5.as_deref())
            .unwrap_or("");
        hash::sha256(format!("{}{}", url, checksum).as_bytes())
    }

    /// Download through the cache when a checksum pins the content,
    /// falling through to the plain downloader otherwise.
    pub fn download(
        &self,
        url: &str,
        dest: &Path,
        options: &DownloadOptions,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        if options.checksum().is_none() {
            return self.downloader.download(url, dest, options, progress);
        }

        if dest.exists() && !options.overwrite {
            return Err(Error::FileExists(dest.display().to_string()));
        }

        let fingerprint = Self::fingerprint(url, options);
        let resource = format!("dl:{}", fingerprint);
        let _guard = self.locks.exclusive(&resource, None)?;

        let cached = self.cache_dir.join(&fingerprint);

        // A dirty entry is a crashed population attempt; discard it
        if is_dirty(&cached) {
            debug!("discarding dirty download cache entry {}", fingerprint);
            let _ = fs::remove_file(&cached);
            clean_dirty(&cached);
        }

        if !cached.exists() {
            set_dirty(&cached)?;
            let mut populate = options.clone();
            populate.overwrite = true;
            let result = self
                .downloader
                .download(url, &cached, &populate, progress);
            if let Err(e) = result {
                let _ = fs::remove_file(&cached);
                clean_dirty(&cached);
                return Err(e);
            }
            clean_dirty(&cached);
            debug!("populated download cache entry {} from {}", fingerprint, url);
        } else {
            debug!("download cache hit for {}", url);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {e}", parent.display()))
            })?;
        }
        fs::copy(&cached, dest).map_err(|e| {
            Error::IoError(format!(
                "Failed to copy cached download to {}: {e}",
                dest.display()
            ))
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;

    fn caching(dir: &Path) -> CachingDownloader {
        let locks = Arc::new(ResourceLocks::new(dir.join("locks")).unwrap());
        CachingDownloader::new(dir.join("dlcache"), locks).unwrap()
    }

    #[test]
    fn test_fingerprint_keyed_by_url_and_checksum() {
        let with_sum = DownloadOptions {
            sha256: Some("ab".repeat(32)),
            ..Default::default()
        };
        let other_sum = DownloadOptions {
            sha256: Some("cd".repeat(32)),
            ..Default::default()
        };
        let a = CachingDownloader::fingerprint("http://host/x", &with_sum);
        let b = CachingDownloader::fingerprint("http://host/y", &with_sum);
        let c = CachingDownloader::fingerprint("http://host/x", &other_sum);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, CachingDownloader::fingerprint("http://host/x", &with_sum));
    }

    #[test]
    fn test_second_fetch_serves_from_cache() {
        let mut server = mockito::Server::new();
        let body = b"immutable artifact";
        let mock = server
            .mock("GET", "/artifact")
            .with_body(body)
            .expect(1)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let dl = caching(dir.path());
        let opts = DownloadOptions {
            sha256: Some(crate::hash::sha256(body)),
            ..Default::default()
        };
        let url = format!("{}/artifact", server.url());

        let first = dir.path().join("first");
        dl.download(&url, &first, &opts, &SilentProgress::new()).unwrap();
        assert_eq!(std::fs::read(&first).unwrap(), body);

        // Delete the destination and fetch again: zero additional requests
        std::fs::remove_file(&first).unwrap();
        let second = dir.path().join("second");
        dl.download(&url, &second, &opts, &SilentProgress::new()).unwrap();
        assert_eq!(std::fs::read(&second).unwrap(), body);

        mock.assert();
    }

    #[test]
    fn test_no_checksum_bypasses_cache() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/mutable")
            .with_body("payload")
            .expect(2)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let dl = caching(dir.path());
        let url = format!("{}/mutable", server.url());

        for name in ["a", "b"] {
            dl.download(
                &url,
                &dir.path().join(name),
                &DownloadOptions::default(),
                &SilentProgress::new(),
            )
            .unwrap();
        }

        // Both fetches hit the network: nothing pinned the content
        mock.assert();
    }

    #[test]
    fn test_dirty_entry_repopulated() {
        let mut server = mockito::Server::new();
        let body = b"artifact";
        let mock = server
            .mock("GET", "/artifact")
            .with_body(body)
            .expect(2)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let dl = caching(dir.path());
        let opts = DownloadOptions {
            sha256: Some(crate::hash::sha256(body)),
            ..Default::default()
        };
        let url = format!("{}/artifact", server.url());

        dl.download(&url, &dir.path().join("a"), &opts, &SilentProgress::new())
            .unwrap();

        // Mark the cached entry as a crashed write; the next fetch must
        // discard it and download again
        let fingerprint = CachingDownloader::fingerprint(&url, &opts);
        set_dirty(&dir.path().join("dlcache").join(&fingerprint)).unwrap();

        dl.download(&url, &dir.path().join("b"), &opts, &SilentProgress::new())
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), body);
        mock.assert();
    }

    #[test]
    fn test_failed_population_leaves_no_entry() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/missing").with_status(404).create();

        let dir = tempfile::tempdir().unwrap();
        let dl = caching(dir.path());
        let opts = DownloadOptions {
            retry: 0,
            sha256: Some("ab".repeat(32)),
            ..Default::default()
        };
        let url = format!("{}/missing", server.url());

        let err = dl
            .download(&url, &dir.path().join("out"), &opts, &SilentProgress::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let fingerprint = CachingDownloader::fingerprint(&url, &opts);
        let cached = dir.path().join("dlcache").join(fingerprint);
        assert!(!cached.exists());
        assert!(!is_dirty(&cached));
    }
}
