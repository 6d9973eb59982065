//! The crate-wide error enum and its `Result` alias.

use std::io;

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors surfaced by index building, reading and combining.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The file does not start with the expected index signature.
    #[error("{path} is not an index of the expected type")]
    BadFormatSignature {
        /// Path of the offending file.
        path: String,
    },
    /// The index body is structurally invalid.
    #[error("error in data for index: {0}")]
    BadIndexData(String),
    /// A key failed arity or character-set validation.
    #[error("invalid key: {0}")]
    BadKey(String),
    /// A value contains forbidden bytes.
    #[error("invalid value: {0}")]
    BadValue(String),
    /// Construction or operation parameters are invalid.
    #[error("invalid options: {0}")]
    BadOptions(String),
    /// The key already has a real node in this index.
    #[error("key {0} is already present")]
    DuplicateKey(String),
    /// The backing file vanished; recoverable through a combined-index
    /// reload when one is configured.
    #[error("{path} no longer exists")]
    StorageNotFound {
        /// Path of the vanished file.
        path: String,
    },
    /// The transport returned fewer bytes than requested for a range that
    /// should exist.
    #[error("short read of {path} at offset {offset}: wanted {expected} bytes, got {actual}")]
    ShortRead {
        /// Path of the file being read.
        path: String,
        /// Offset the read started at.
        offset: u64,
        /// Bytes requested.
        expected: usize,
        /// Bytes actually returned.
        actual: usize,
    },
}

impl TesseraError {
    /// True for errors that the combined-index reload protocol may absorb.
    pub fn is_reloadable(&self) -> bool {
        matches!(self, TesseraError::StorageNotFound { .. })
    }
}
