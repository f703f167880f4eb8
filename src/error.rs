// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Error taxonomy for the secure storage layer.
//!
//! Validation and quota failures are raised before anything on disk is
//! touched. Temp-file cleanup failures never appear here: they are retried
//! by the cleanup queue instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Raw path rejected by the [`PathValidator`](crate::storage::PathValidator).
#[derive(Debug, Error)]
pub enum PathError {
    #[error("malformed path: {0}")]
    Malformed(String),

    #[error("directory traversal sequence in path")]
    Traversal,

    #[error("bidirectional control character U+{0:04X} in path")]
    Spoofing(u32),

    #[error("reserved device name in path component: {0}")]
    ReservedName(String),

    #[error("alternate data stream marker in path")]
    AdsDetected,

    #[error("path too long: {len} (limit {limit})")]
    TooLong { len: usize, limit: usize },

    #[error("symbolic link in path: {0}")]
    SymlinkDetected(PathBuf),

    #[error("path resolves outside allowed root: {0}")]
    OutsideRoot(PathBuf),

    #[error("path is inside a directory reserved for internal use: {0}")]
    ReservedDirectory(PathBuf),

    #[error("allowed root unavailable: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("temp directory quota exceeded: {current} + {requested} bytes > {max}")]
    QuotaExceeded {
        current: u64,
        requested: u64,
        max: u64,
    },

    #[error("insufficient disk space: {available} bytes available, {requested} requested, {min_free} must stay free")]
    InsufficientDisk {
        available: u64,
        requested: u64,
        min_free: u64,
    },

    #[error("quota check I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("path is already locked: {0}")]
    AlreadyLocked(PathBuf),

    #[error("timed out waiting for lock: {0}")]
    Timeout(PathBuf),
}

/// Failure reported by an external `Encryptor`/`Decryptor`.
#[derive(Debug, Error)]
#[error("cipher failure: {0}")]
pub struct CipherError(pub String);

impl CipherError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("encryption key must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("system random source unavailable")]
    RandomUnavailable,
}

#[derive(Debug, Error)]
pub enum TempFileError {
    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("temp file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("could not confirm owner-only permissions on {0}")]
    Permission(PathBuf),
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("encryption key rejected as weak")]
    WeakKey,

    #[error("content too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("write I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("could not confirm owner-only permissions on {0}")]
    Permission(PathBuf),

    #[error(transparent)]
    Quota(QuotaError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Path(PathError),
}

impl From<TempFileError> for WriteError {
    fn from(e: TempFileError) -> Self {
        match e {
            TempFileError::Quota(e) => WriteError::Quota(e),
            TempFileError::Path(e) => WriteError::Path(e),
            TempFileError::Io(e) => WriteError::Io(e),
            TempFileError::Permission(p) => WriteError::Permission(p),
        }
    }
}

impl From<PathError> for WriteError {
    fn from(e: PathError) -> Self {
        WriteError::Path(e)
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("encrypted file not found: {0}")]
    NotFound(PathBuf),

    #[error(transparent)]
    QuotaExceeded(QuotaError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error("decrypted content too large: {size} bytes (max {max})")]
    ContentTooLarge { size: u64, max: u64 },

    #[error("read I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("encryption key rejected as weak")]
    WeakKey,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Path(PathError),
}

impl From<TempFileError> for ReadError {
    fn from(e: TempFileError) -> Self {
        match e {
            TempFileError::Quota(e) => ReadError::QuotaExceeded(e),
            TempFileError::Path(e) => ReadError::Path(e),
            TempFileError::Io(e) => ReadError::Io(e),
            TempFileError::Permission(p) => ReadError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("could not confirm owner-only permissions on {}", p.display()),
            )),
        }
    }
}

impl From<QuotaError> for ReadError {
    fn from(e: QuotaError) -> Self {
        ReadError::QuotaExceeded(e)
    }
}

/// Umbrella error for [`StorageContext`](crate::storage::StorageContext)
/// operations that are not a single read or write.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    TempFile(#[from] TempFileError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid user name: {0}")]
    InvalidUser(String),

    #[error("storage context is missing a cipher")]
    MissingCipher,

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_file_errors_map_onto_write_errors() {
        let quota = TempFileError::Quota(QuotaError::QuotaExceeded {
            current: 10,
            requested: 5,
            max: 12,
        });
        assert!(matches!(
            WriteError::from(quota),
            WriteError::Quota(QuotaError::QuotaExceeded { .. })
        ));

        let perm = TempFileError::Permission(PathBuf::from("/tmp/x"));
        assert!(matches!(WriteError::from(perm), WriteError::Permission(_)));
    }

    #[test]
    fn temp_file_quota_errors_map_onto_read_quota_exceeded() {
        let disk = TempFileError::Quota(QuotaError::InsufficientDisk {
            available: 1,
            requested: 2,
            min_free: 3,
        });
        assert!(matches!(ReadError::from(disk), ReadError::QuotaExceeded(_)));
    }

    #[test]
    fn messages_are_human_readable() {
        let err = WriteError::TooLarge { size: 11, max: 10 };
        assert_eq!(err.to_string(), "content too large: 11 bytes (max 10)");

        let err = PathError::Spoofing(0x202E);
        assert_eq!(err.to_string(), "bidirectional control character U+202E in path");
    }
}
