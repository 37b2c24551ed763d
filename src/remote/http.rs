// src/remote/http.rs

//! Remote source over a static-file HTTP layout
//!
//! The server side is out of scope; this client consumes any dumb file
//! server laying recipes out as:
//!
//! ```text
//! <url>/<name>/refs                                  newline-separated base references
//! <url>/<name>/<version>/<user>/<channel>/latest     text file holding the latest rrev
//! <url>/<name>/<version>/<user>/<channel>/<rrev>/conanmanifest.txt
//! <url>/<name>/<version>/<user>/<channel>/<rrev>/export.tgz
//! ```
//!
//! Absent user/channel appear as `_`, mirroring the cache layout.
//! Export archives are gzip-compressed tarballs, unpacked into the
//! recipe's `export/` folder after download. Servers that carry no
//! bundled archive are consumed file by file instead, each fetch keyed
//! into the fingerprint download cache under its manifest digest; in
//! both cases the resulting tree is verified against the manifest.

use crate::cache::layout::EXPORT_FOLDER;
use crate::cache::DataCache;
use crate::download::cached::CachingDownloader;
use crate::download::{DownloadOptions, FileDownloader};
use crate::error::{Error, Result};
use crate::manifest::{FileTreeManifest, MANIFEST_FILE};
use crate::progress::SilentProgress;
use crate::reference::RecipeReference;
use crate::version::Version;
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::{Remote, RemoteSource};

/// Timeout for small metadata fetches
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Archive file name under `dl/export`
const EXPORT_ARCHIVE: &str = "export.tgz";

/// `RemoteSource` implementation over a static-file layout
pub struct HttpRemoteSource {
    remote: Remote,
    client: Client,
    downloader: FileDownloader,
}

impl HttpRemoteSource {
    /// Create a source for one configured remote
    pub fn new(remote: Remote) -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(!remote.verify_ssl)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            remote,
            client,
            downloader: FileDownloader::new()?,
        })
    }

    fn base_url(&self) -> String {
        self.remote.url.trim_end_matches('/').to_string()
    }

    fn reference_url(&self, reference: &RecipeReference) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.base_url(),
            reference.name,
            reference.version,
            reference.user.as_deref().unwrap_or("_"),
            reference.channel.as_deref().unwrap_or("_"),
        )
    }

    fn get_text(&self, url: &str) -> Result<String> {
        debug!("fetching {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::Transport(format!("Error fetching {}: '{}'", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                404 => Error::NotFound(format!("Not found: {}", url)),
                401 | 403 => Error::AuthRequired(url.to_string()),
                code => Error::Transport(format!("Error {} fetching {}", code, url)),
            });
        }
        response
            .text()
            .map_err(|e| Error::Transport(format!("Failed to read response from {}: {e}", url)))
    }

    fn pinned_revision(&self, reference: &RecipeReference) -> Result<String> {
        reference.revision.clone().ok_or_else(|| {
            Error::ParseError(format!(
                "remote operation on '{}' requires a pinned recipe revision",
                reference.base_str()
            ))
        })
    }
}

impl RemoteSource for HttpRemoteSource {
    fn name(&self) -> &str {
        &self.remote.name
    }

    fn versions(&self, sample: &RecipeReference) -> Result<Vec<Version>> {
        let url = format!("{}/{}/refs", self.base_url(), sample.name);
        let listing = match self.get_text(&url) {
            Ok(text) => text,
            Err(Error::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut versions = Vec::new();
        for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let candidate = RecipeReference::parse(line)?;
            if candidate.same_identity(sample) {
                versions.push(candidate.version);
            }
        }
        Ok(versions)
    }

    fn latest_recipe_revision(&self, reference: &RecipeReference) -> Result<RecipeReference> {
        let url = format!("{}/latest", self.reference_url(reference));
        let rrev = self.get_text(&url).map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!(
                "{} not in remote '{}'",
                reference.base_str(),
                self.remote.name
            )),
            other => other,
        })?;
        Ok(reference.with_revision(rrev.trim()))
    }

    fn recipe_manifest(&self, reference: &RecipeReference) -> Result<FileTreeManifest> {
        let rrev = self.pinned_revision(reference)?;
        let url = format!("{}/{}/{}", self.reference_url(reference), rrev, MANIFEST_FILE);
        FileTreeManifest::parse(&self.get_text(&url)?)
    }

    fn fetch_recipe(
        &self,
        reference: &RecipeReference,
        cache: &DataCache,
    ) -> Result<RecipeReference> {
        let pinned = if reference.revision.is_some() {
            reference.clone()
        } else {
            self.latest_recipe_revision(reference)?
        };
        let rrev = self.pinned_revision(&pinned)?;

        let manifest_url = format!("{}/{}/{}", self.reference_url(&pinned), rrev, MANIFEST_FILE);
        let manifest = FileTreeManifest::parse(&self.get_text(&manifest_url).map_err(
            |e| match e {
                Error::NotFound(_) => Error::NotFound(format!(
                    "{} not in remote '{}'",
                    pinned, self.remote.name
                )),
                other => other,
            },
        )?)?;

        let recipe_layout = cache.create_recipe_layout(&pinned, Some(&self.remote.name))?;
        let populated = self.populate_layout(&pinned, &manifest, cache, &recipe_layout);
        if populated.is_err() {
            // A half-fetched layout must not survive as a cache row
            let _ = cache.remove_recipe(&pinned);
        }
        populated?;

        info!("Downloaded recipe revision {}", rrev);
        Ok(pinned)
    }
}

impl HttpRemoteSource {
    fn populate_layout(
        &self,
        pinned: &RecipeReference,
        manifest: &FileTreeManifest,
        cache: &DataCache,
        recipe_layout: &crate::cache::layout::RecipeLayout,
    ) -> Result<()> {
        let rrev = self.pinned_revision(pinned)?;
        let archive_url = format!("{}/{}/{}", self.reference_url(pinned), rrev, EXPORT_ARCHIVE);
        let archive_dest = recipe_layout.download_export().join(EXPORT_ARCHIVE);

        let options = DownloadOptions {
            overwrite: true,
            verify_tls: self.remote.verify_ssl,
            ..Default::default()
        };
        match self
            .downloader
            .download(&archive_url, &archive_dest, &options, &SilentProgress::new())
        {
            Ok(()) => untgz(&archive_dest, &recipe_layout.export())?,
            Err(Error::NotFound(_)) => {
                // No bundled archive on this server: fetch the files the
                // manifest lists, one by one. Each URL is revision
                // qualified and checksummed, so fetches go through the
                // fingerprint-keyed download cache.
                debug!("no {} for {}, fetching per-file", EXPORT_ARCHIVE, pinned);
                self.fetch_files(pinned, manifest, cache, recipe_layout)?;
            }
            Err(e) => return Err(e),
        }

        manifest.save(&recipe_layout.export())?;

        // The unpacked tree must agree with the manifest it was served with
        let unpacked = FileTreeManifest::create(&recipe_layout.export())?;
        if unpacked != *manifest {
            return Err(Error::ChecksumMismatch {
                expected: manifest.combined_hash(),
                actual: unpacked.combined_hash(),
            });
        }
        Ok(())
    }

    /// Manifest-driven download of each export file through the caching
    /// downloader.
    fn fetch_files(
        &self,
        reference: &RecipeReference,
        manifest: &FileTreeManifest,
        cache: &DataCache,
        recipe_layout: &crate::cache::layout::RecipeLayout,
    ) -> Result<()> {
        let rrev = self.pinned_revision(reference)?;
        let caching = CachingDownloader::new(cache.root().join("dl"), cache.locks())?;

        for (path, digest) in manifest.files() {
            let url = format!(
                "{}/{}/{}/{}",
                self.reference_url(reference),
                rrev,
                EXPORT_FOLDER,
                path
            );
            let dest = recipe_layout.export().join(path);
            let options = DownloadOptions {
                overwrite: true,
                verify_tls: self.remote.verify_ssl,
                md5: Some(digest.clone()),
                ..Default::default()
            };
            caching.download(&url, &dest, &options, &SilentProgress::new())?;
        }
        Ok(())
    }
}

/// Unpack a gzip-compressed tarball into a directory
pub fn untgz(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)
        .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", archive.display())))?;
    let mut tarball = tar::Archive::new(GzDecoder::new(file));
    tarball
        .unpack(dest)
        .map_err(|e| Error::IoError(format!("Failed to unpack {}: {e}", archive.display())))?;
    Ok(())
}
