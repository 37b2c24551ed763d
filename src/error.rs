// src/error.rs

//! Error types for Quarry operations
//!
//! Every failure class a caller (or a test) may need to distinguish gets
//! its own variant. Downloaders retry `Transport` and `Truncated`;
//! everything else surfaces immediately.

use thiserror::Error;

/// Main error type for Quarry
#[derive(Error, Debug)]
pub enum Error {
    /// Reference absent from cache and all remotes, or URL returned 404
    #[error("not found: {0}")]
    NotFound(String),

    /// Server demanded credentials and none (or no token) were presented
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Server rejected the presented credentials
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Network, DNS or TLS failure; eligible for the retry policy
    #[error("transport error: {0}")]
    Transport(String),

    /// Downloaded bytes did not match the expected checksum
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Download ended short of the announced length with no way to resume
    #[error("transfer interrupted before complete: {received} < {expected}")]
    Truncated { received: u64, expected: u64 },

    /// Destination file already exists and overwrite was not requested
    #[error("the file to download already exists: '{0}'")]
    FileExists(String),

    /// Malformed request; never retried
    #[error("request error: {0}")]
    RequestError(String),

    /// Two dependency paths demand incompatible versions of one package
    #[error("version conflict: '{require}' required by '{node}' conflicts with '{existing}' required by '{prev_node}'")]
    VersionConflict {
        require: String,
        node: String,
        existing: String,
        prev_node: String,
    },

    /// Diamond closed over a node whose options contradict the incoming edge
    #[error("option conflict on '{option}': '{node}' wants '{value}' but '{prev_node}' already set '{prev_value}'")]
    OptionConflict {
        option: String,
        value: String,
        prev_value: String,
        node: String,
        prev_node: String,
    },

    /// Two packages in the same context claim the same provides identifier
    #[error("provides conflict: both '{node}' and '{prev_node}' provide '{provider}'")]
    ProvidesConflict {
        provider: String,
        node: String,
        prev_node: String,
    },

    /// Advisory lock not acquired within the caller's deadline
    #[error("could not acquire lock on '{0}' within the timeout")]
    LockTimeout(String),

    /// Dirty bit observed on read, or cached tree disagrees with its row
    #[error("cache corruption: {0}")]
    CacheCorruption(String),

    /// A recipe capability failed during configure/requirements
    #[error("recipe error: {0}")]
    RecipeError(String),

    /// Unique-key violation on insert
    #[error("reference already exists: {0}")]
    AlreadyExists(String),

    /// Exact-match lookup found no row
    #[error("no entry for reference '{0}'")]
    DoesNotExist(String),

    /// Filesystem failure; fatal, with the offending path in the message
    #[error("io error: {0}")]
    IoError(String),

    /// SQLite failure; the enclosing transaction is rolled back
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Malformed reference, version, manifest or registry content
    #[error("parse error: {0}")]
    ParseError(String),
}

impl Error {
    /// Exit code for the CLI wrapper.
    ///
    /// 0 success, 1 usage, 2 recipe/build failure, 3 resolver conflict,
    /// 6 network or remote failure. Usage errors (1) are produced by the
    /// argument parser, not by this taxonomy.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::VersionConflict { .. }
            | Error::OptionConflict { .. }
            | Error::ProvidesConflict { .. } => 3,
            Error::NotFound(_)
            | Error::AuthRequired(_)
            | Error::Forbidden(_)
            | Error::Transport(_)
            | Error::Truncated { .. }
            | Error::ChecksumMismatch { .. } => 6,
            _ => 2,
        }
    }

    /// Whether the download retry policy applies to this error
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Truncated { .. })
    }
}

/// Result type for Quarry operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let conflict = Error::VersionConflict {
            require: "c/2.0".into(),
            node: "b/1.0".into(),
            existing: "c/1.0".into(),
            prev_node: "a/1.0".into(),
        };
        assert_eq!(conflict.exit_code(), 3);

        assert_eq!(Error::NotFound("lib/1.0".into()).exit_code(), 6);
        assert_eq!(Error::Transport("timeout".into()).exit_code(), 6);
        assert_eq!(Error::RecipeError("bad configure".into()).exit_code(), 2);
        assert_eq!(Error::LockTimeout("lib/1.0".into()).exit_code(), 2);
    }

    #[test]
    fn test_retriable_classification() {
        assert!(Error::Transport("reset".into()).is_retriable());
        assert!(Error::Truncated {
            received: 10,
            expected: 20
        }
        .is_retriable());

        assert!(!Error::NotFound("x".into()).is_retriable());
        assert!(!Error::AuthRequired("x".into()).is_retriable());
        assert!(!Error::Forbidden("x".into()).is_retriable());
        assert!(!Error::RequestError("x".into()).is_retriable());
    }
}
