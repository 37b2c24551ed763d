// src/download/mod.rs

//! Single-URL downloads with retry, resume and checksum verification
//!
//! The contract, in order:
//! 1. An existing destination fails with `FileExists` unless overwrite
//!    was requested.
//! 2. HTTP status mapping: 404 is `NotFound`, 401 is `AuthRequired`,
//!    403 is `Forbidden` when a token was presented (otherwise the
//!    server is really asking for credentials), anything else non-2xx
//!    is `Transport`.
//! 3. Bodies stream to disk in fixed-size chunks, counting bytes
//!    against `Content-Length` (or the `Content-Range` total when
//!    resuming; a resumed response whose start disagrees with the
//!    on-disk size is a transport error).
//! 4. A short read resumes via HTTP ranges when the server advertises
//!    `Accept-Ranges: bytes`; otherwise it is `Truncated`. Gzip
//!    content-encoding makes announced sizes unreliable, so mismatches
//!    are tolerated there.
//! 5. After a complete download any supplied checksum is verified;
//!    a mismatch deletes the file.
//!
//! Retries apply to transport-class failures only, sleeping `retry_wait`
//! seconds between attempts. `download_set` fans a list of downloads out
//! over a worker pool and joins them all before returning.

pub mod cached;

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::progress::ProgressTracker;
use rayon::prelude::*;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Credentials for a download
#[derive(Debug, Clone, Default)]
pub struct Auth {
    /// Bearer token
    pub token: Option<String>,
    /// Basic user/password pair, used when no token is set
    pub basic: Option<(String, String)>,
}

/// Options for a single download
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Additional attempts after the first failure
    pub retry: u32,
    /// Seconds to sleep between attempts
    pub retry_wait: u64,
    /// Verify TLS certificates
    pub verify_tls: bool,
    /// Replace an existing destination file
    pub overwrite: bool,
    /// Continue an interrupted download: keep existing destination
    /// bytes and request the remainder via HTTP ranges
    pub resume: bool,
    /// Credentials to present
    pub auth: Option<Auth>,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Expected MD5 of the downloaded bytes
    pub md5: Option<String>,
    /// Expected SHA-1 of the downloaded bytes
    pub sha1: Option<String>,
    /// Expected SHA-256 of the downloaded bytes
    pub sha256: Option<String>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            retry: 2,
            retry_wait: 0,
            verify_tls: true,
            overwrite: false,
            resume: false,
            auth: None,
            headers: Vec::new(),
            md5: None,
            sha1: None,
            sha256: None,
        }
    }
}

impl DownloadOptions {
    /// The strongest checksum supplied, if any
    pub fn checksum(&self) -> Option<(&str, HashAlgorithm)> {
        if let Some(sum) = &self.sha256 {
            Some((sum, HashAlgorithm::Sha256))
        } else if let Some(sum) = &self.sha1 {
            Some((sum, HashAlgorithm::Sha1))
        } else {
            self.md5.as_deref().map(|sum| (sum, HashAlgorithm::Md5))
        }
    }
}

/// One entry of a batched download
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub url: String,
    pub dest: PathBuf,
    pub options: DownloadOptions,
}

/// HTTP downloader with retry, resume and checksum support
pub struct FileDownloader {
    client: Client,
    insecure_client: Client,
}

impl FileDownloader {
    /// Create a new downloader
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {e}")))?;
        let insecure_client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            insecure_client,
        })
    }

    /// Download a URL to an absolute destination path
    pub fn download(
        &self,
        url: &str,
        dest: &Path,
        options: &DownloadOptions,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        if dest.exists() {
            if options.resume {
                debug!("continuing download into existing file {}", dest.display());
            } else if !options.overwrite {
                return Err(Error::FileExists(dest.display().to_string()));
            } else {
                warn!("file '{}' already exists, overwriting", dest.display());
            }
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {e}", parent.display()))
            })?;
        }

        let result = self.download_with_retry(url, dest, options, progress);
        if result.is_err() && dest.exists() {
            let _ = fs::remove_file(dest);
        }
        result
    }

    /// Download a batch, optionally one worker per job, joining all
    /// workers before returning. The first failure propagates after the
    /// join.
    pub fn download_set(
        &self,
        jobs: &[DownloadJob],
        parallel: bool,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        let run = |job: &DownloadJob| -> Result<()> {
            let name = job
                .dest
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| job.url.clone());
            let child = progress.child(&name, 0);
            self.download(&job.url, &job.dest, &job.options, child.as_ref())
        };

        if parallel {
            jobs.par_iter().map(run).collect::<Result<Vec<()>>>()?;
        } else {
            for job in jobs {
                run(job)?;
            }
        }
        Ok(())
    }

    fn download_with_retry(
        &self,
        url: &str,
        dest: &Path,
        options: &DownloadOptions,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        for attempt in 0..=options.retry {
            match self.download_file(url, dest, options, options.resume, progress) {
                Ok(()) => return self.check_checksums(dest, options),
                Err(e) if e.is_retriable() && attempt < options.retry => {
                    warn!("download attempt {} failed: {}", attempt + 1, e);
                    if options.retry_wait > 0 {
                        info!("Waiting {} seconds to retry...", options.retry_wait);
                        std::thread::sleep(Duration::from_secs(options.retry_wait));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("retry loop returns on the final attempt")
    }

    fn check_checksums(&self, dest: &Path, options: &DownloadOptions) -> Result<()> {
        if let Some(sum) = &options.md5 {
            hash::check_checksum(HashAlgorithm::Md5, dest, sum)?;
        }
        if let Some(sum) = &options.sha1 {
            hash::check_checksum(HashAlgorithm::Sha1, dest, sum)?;
        }
        if let Some(sum) = &options.sha256 {
            hash::check_checksum(HashAlgorithm::Sha256, dest, sum)?;
        }
        Ok(())
    }

    fn download_file(
        &self,
        url: &str,
        dest: &Path,
        options: &DownloadOptions,
        try_resume: bool,
        progress: &dyn ProgressTracker,
    ) -> Result<()> {
        let range_start = if try_resume && dest.exists() {
            fs::metadata(dest)
                .map_err(|e| Error::IoError(format!("Failed to stat {}: {e}", dest.display())))?
                .len()
        } else {
            0
        };

        let client = if options.verify_tls {
            &self.client
        } else {
            &self.insecure_client
        };

        let mut request = client.get(url);
        for (name, value) in &options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if range_start > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", range_start));
        }
        let mut token_presented = false;
        if let Some(auth) = &options.auth {
            if let Some(token) = &auth.token {
                request = request.bearer_auth(token);
                token_presented = true;
            } else if let Some((user, password)) = &auth.basic {
                request = request.basic_auth(user, Some(password));
            }
        }

        let mut response = request.send().map_err(|e| {
            if e.is_builder() {
                Error::RequestError(format!("Invalid request for {}: '{}'", url, e))
            } else {
                Error::Transport(format!("Error downloading file {}: '{}'", url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status.as_u16() {
                404 => Error::NotFound(format!("Not found: {}", url)),
                401 => Error::AuthRequired(url.to_string()),
                403 if token_presented => Error::Forbidden(url.to_string()),
                403 => Error::AuthRequired(url.to_string()),
                code => Error::Transport(format!("Error {} downloading file {}", code, url)),
            });
        }

        let header_str = |name: header::HeaderName| -> Option<String> {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let content_range = header_str(header::CONTENT_RANGE);
        let content_length = header_str(header::CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
        let accept_ranges = header_str(header::ACCEPT_RANGES);
        let gzip_encoded = header_str(header::CONTENT_ENCODING).as_deref() == Some("gzip");

        let total_length = if range_start > 0 {
            parse_content_range(url, content_range.as_deref(), range_start)?
        } else {
            content_length.unwrap_or(0)
        };

        let action = if range_start == 0 {
            "Downloading"
        } else {
            "Continuing download of"
        };
        debug!("{} {} -> {}", action, url, dest.display());
        if total_length > 0 {
            progress.set_length(total_length);
        }
        progress.set_position(range_start);

        let mut file = OpenOptions::new()
            .create(true)
            .append(range_start > 0)
            .write(range_start == 0)
            .truncate(range_start == 0)
            .open(dest)
            .map_err(|e| Error::IoError(format!("Failed to open {}: {e}", dest.display())))?;

        let mut downloaded = range_start;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        loop {
            let n = response
                .read(&mut buffer)
                .map_err(|e| Error::Transport(format!("Failed to read response from {}: {e}", url)))?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])
                .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", dest.display())))?;
            downloaded += n as u64;
            progress.increment(n as u64);
        }
        drop(file);

        // Gzip-encoded responses announce the compressed size; what we
        // counted is decoded bytes, so a mismatch is meaningless there
        if total_length > 0 && downloaded != total_length && !gzip_encoded {
            if total_length > downloaded
                && downloaded > range_start
                && accept_ranges.as_deref() == Some("bytes")
            {
                return self.download_file(url, dest, options, true, progress);
            }
            return Err(Error::Truncated {
                received: downloaded,
                expected: total_length,
            });
        }

        Ok(())
    }
}

/// Parse a `Content-Range: bytes start-end/total` header for a resumed
/// download and validate the start against the on-disk size.
fn parse_content_range(url: &str, value: Option<&str>, range_start: u64) -> Result<u64> {
    let value = value.unwrap_or("");
    let re = Regex::new(r"^bytes (\d+)-(\d+)/(\d+)").expect("valid content-range regex");
    let captures = re.captures(value).ok_or_else(|| {
        Error::Transport(format!(
            "Error in resumed download from {}\nIncorrect Content-Range header {}",
            url, value
        ))
    })?;

    let start: u64 = captures[1].parse().unwrap_or(u64::MAX);
    if start != range_start {
        return Err(Error::Transport(format!(
            "Error in resumed download from {}\nIncorrect Content-Range header {}",
            url, value
        )));
    }
    captures[3]
        .parse()
        .map_err(|e| Error::Transport(format!("Bad Content-Range total from {}: {e}", url)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;

    fn downloader() -> FileDownloader {
        FileDownloader::new().unwrap()
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("u", Some("bytes 100-499/500"), 100).unwrap(),
            500
        );
        // Start disagreeing with the on-disk size is a transport error
        assert!(parse_content_range("u", Some("bytes 50-499/500"), 100).is_err());
        assert!(parse_content_range("u", Some("garbage"), 100).is_err());
        assert!(parse_content_range("u", None, 100).is_err());
    }

    #[test]
    fn test_existing_destination_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        std::fs::write(&dest, b"precious").unwrap();

        let err = downloader()
            .download(
                "http://127.0.0.1:1/never-contacted",
                &dest,
                &DownloadOptions::default(),
                &SilentProgress::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::FileExists(_)));
        // The pre-existing file is untouched
        assert_eq!(std::fs::read(&dest).unwrap(), b"precious");
    }

    #[test]
    fn test_status_mapping() {
        let mut server = mockito::Server::new();
        let dir = tempfile::tempdir().unwrap();
        let opts = DownloadOptions {
            retry: 0,
            ..Default::default()
        };

        let m404 = server.mock("GET", "/missing").with_status(404).create();
        let err = downloader()
            .download(
                &format!("{}/missing", server.url()),
                &dir.path().join("a"),
                &opts,
                &SilentProgress::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        m404.assert();

        let m401 = server.mock("GET", "/private").with_status(401).create();
        let err = downloader()
            .download(
                &format!("{}/private", server.url()),
                &dir.path().join("b"),
                &opts,
                &SilentProgress::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AuthRequired(_)));
        m401.assert();

        // 403 without a token still means "credentials required"
        let m403 = server.mock("GET", "/forbidden").with_status(403).create();
        let err = downloader()
            .download(
                &format!("{}/forbidden", server.url()),
                &dir.path().join("c"),
                &opts,
                &SilentProgress::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AuthRequired(_)));
        m403.assert();

        // 403 with a bearer token is a hard Forbidden
        let m403t = server.mock("GET", "/forbidden-token").with_status(403).create();
        let with_token = DownloadOptions {
            retry: 0,
            auth: Some(Auth {
                token: Some("secret".to_string()),
                basic: None,
            }),
            ..Default::default()
        };
        let err = downloader()
            .download(
                &format!("{}/forbidden-token", server.url()),
                &dir.path().join("d"),
                &with_token,
                &SilentProgress::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        m403t.assert();
    }

    #[test]
    fn test_checksum_mismatch_deletes_file() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/payload")
            .with_body("actual bytes")
            .create();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("payload");
        let opts = DownloadOptions {
            retry: 0,
            sha256: Some(crate::hash::sha256(b"different bytes")),
            ..Default::default()
        };

        let err = downloader()
            .download(
                &format!("{}/payload", server.url()),
                &dest,
                &opts,
                &SilentProgress::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_resume_completes_partial_file() {
        let full = b"0123456789abcdef";
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/blob")
            .match_header("range", "bytes=8-")
            .with_status(206)
            .with_header("Content-Range", "bytes 8-15/16")
            .with_body(&full[8..])
            .create();

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("blob");
        std::fs::write(&dest, &full[..8]).unwrap();

        let d = downloader();
        d.download_file(
            &format!("{}/blob", server.url()),
            &dest,
            &DownloadOptions::default(),
            true,
            &SilentProgress::new(),
        )
        .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), full);
    }

    #[test]
    fn test_download_set_parallel() {
        let mut server = mockito::Server::new();
        let _a = server.mock("GET", "/a").with_body("aaa").create();
        let _b = server.mock("GET", "/b").with_body("bbb").create();

        let dir = tempfile::tempdir().unwrap();
        let jobs = vec![
            DownloadJob {
                url: format!("{}/a", server.url()),
                dest: dir.path().join("a"),
                options: DownloadOptions::default(),
            },
            DownloadJob {
                url: format!("{}/b", server.url()),
                dest: dir.path().join("b"),
                options: DownloadOptions::default(),
            },
        ];

        downloader()
            .download_set(&jobs, true, &SilentProgress::new())
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"aaa");
        assert_eq!(std::fs::read(dir.path().join("b")).unwrap(), b"bbb");
    }
}
