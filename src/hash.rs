// src/hash.rs

//! Configurable hashing for file integrity and content addressing
//!
//! A unified interface over the three digest algorithms the package
//! pipeline verifies against:
//! - **MD5**: manifest lines and combined manifest hashes (format requirement)
//! - **SHA-1**: package identity hashes
//! - **SHA-256**: download checksums and cache fingerprints

use crate::error::{Error, Result};
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::FromStr;

/// Hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HashAlgorithm {
    /// MD5 (128-bit), kept for the manifest line format
    Md5,
    /// SHA-1 (160-bit), used for configuration identity hashes
    Sha1,
    /// SHA-256 (256-bit), used for artifact checksums and fingerprints
    #[default]
    Sha256,
}

impl HashAlgorithm {
    /// Hash output length in bytes
    #[inline]
    pub const fn output_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// Hash output length as a hex string
    #[inline]
    pub const fn hex_len(&self) -> usize {
        self.output_len() * 2
    }

    /// Algorithm name as a string
    #[inline]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(Error::ParseError(format!("unknown hash algorithm: {}", s))),
        }
    }
}

/// Hasher that can compute digests incrementally with any supported algorithm
pub struct Hasher {
    algorithm: HashAlgorithm,
    state: HasherState,
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    /// Create a new hasher with the specified algorithm
    pub fn new(algorithm: HashAlgorithm) -> Self {
        let state = match algorithm {
            HashAlgorithm::Md5 => HasherState::Md5(Md5::new()),
            HashAlgorithm::Sha1 => HasherState::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { algorithm, state }
    }

    /// Update the hasher with more data
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
        }
    }

    /// Finalize and return the digest as lowercase hex
    pub fn finalize(self) -> String {
        match self.state {
            HasherState::Md5(h) => hex::encode(h.finalize()),
            HasherState::Sha1(h) => hex::encode(h.finalize()),
            HasherState::Sha256(h) => hex::encode(h.finalize()),
        }
    }

    /// The algorithm being used
    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }
}

/// Compute the digest of a byte slice as lowercase hex
pub fn hash_bytes(algorithm: HashAlgorithm, data: &[u8]) -> String {
    let mut hasher = Hasher::new(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the digest of data from a reader
pub fn hash_reader<R: Read>(algorithm: HashAlgorithm, reader: &mut R) -> io::Result<String> {
    let mut hasher = Hasher::new(algorithm);
    let mut buffer = [0u8; 8192];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize())
}

/// Compute the digest of a file's contents
pub fn hash_file(algorithm: HashAlgorithm, path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| Error::IoError(format!("Failed to open {} for hashing: {e}", path.display())))?;
    hash_reader(algorithm, &mut file)
        .map_err(|e| Error::IoError(format!("Failed to read {} for hashing: {e}", path.display())))
}

/// Verify a file's digest against an expected lowercase hex value
///
/// The expected string is length-checked first so an obviously malformed
/// checksum fails as a parse error rather than a mismatch.
pub fn check_checksum(algorithm: HashAlgorithm, path: &Path, expected: &str) -> Result<()> {
    if expected.len() != algorithm.hex_len() || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::ParseError(format!(
            "invalid {} checksum '{}'",
            algorithm, expected
        )));
    }

    let actual = hash_file(algorithm, path)?;
    if actual != expected.to_lowercase() {
        return Err(Error::ChecksumMismatch {
            expected: expected.to_lowercase(),
            actual,
        });
    }
    Ok(())
}

/// Compute MD5 hex (convenience function)
#[inline]
pub fn md5(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Md5, data)
}

/// Compute SHA-1 hex (convenience function)
#[inline]
pub fn sha1(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha1, data)
}

/// Compute SHA-256 hex (convenience function)
#[inline]
pub fn sha256(data: &[u8]) -> String {
    hash_bytes(HashAlgorithm::Sha256, data)
}
