// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Atomic encrypted reads and writes over an external cipher.
//!
//! ## Write path
//!
//! ```text
//! plaintext -> Temp/<random>.tmp -> Encryptor -> .<name>.<id>.staging
//!           -> owner-only + verify -> rename over target
//! ```
//!
//! The target is only ever replaced by a rename, so a failure at any step
//! leaves it missing (if it was missing) or byte-identical (if it existed).
//!
//! ## Read path
//!
//! ```text
//! target -> quota check (1.1x) -> Decryptor -> Temp/<random>.tmp -> bounded read
//! ```
//!
//! The decrypted size is checked again after reading; the 1.1x estimate is
//! only a guess about a file an attacker may control.
//!
//! In both directions the plaintext scratch file is removed by its handle on
//! every exit path, or parked in the cleanup queue if the OS refuses.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::cipher::{Decryptor, Encryptor};
use super::guard::defer;
use super::key::EncryptionKey;
use super::lock::LockRegistry;
use super::os_ops::{EntryKind, OsFileOps};
use super::quota::decrypted_estimate;
use super::temp::SecureTempFileManager;
use super::validation::{PathValidator, ValidatedPath};
use crate::config::{MAX_CONTENT_SIZE, MAX_ENCRYPTED_FILE_SIZE};
use crate::error::{ReadError, WriteError};

/// Sibling path the encryptor writes before the rename publishes it.
fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.{}.staging", Uuid::new_v4().simple()))
}

fn owner_only_verified(ops: &dyn OsFileOps, path: &Path) -> bool {
    if let Err(e) = ops.set_owner_only(path, EntryKind::File) {
        tracing::warn!(path = %path.display(), error = %e, "Setting permissions failed");
        return false;
    }
    match ops.has_owner_only(path, EntryKind::File) {
        Ok(true) => true,
        Ok(false) => {
            tracing::warn!(path = %path.display(), "Permissions did not stick");
            false
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Permission check failed");
            false
        }
    }
}

#[derive(Clone)]
pub struct AtomicEncryptedWriter {
    temp_files: SecureTempFileManager,
    locks: Arc<LockRegistry>,
    validator: PathValidator,
    ops: Arc<dyn OsFileOps>,
    encryptor: Arc<dyn Encryptor>,
    lock_timeout: Duration,
}

impl AtomicEncryptedWriter {
    pub fn new(
        temp_files: SecureTempFileManager,
        locks: Arc<LockRegistry>,
        validator: PathValidator,
        ops: Arc<dyn OsFileOps>,
        encryptor: Arc<dyn Encryptor>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            temp_files,
            locks,
            validator,
            ops,
            encryptor,
            lock_timeout,
        }
    }

    /// Replace `target` with the encryption of `content`.
    ///
    /// # Errors
    /// - `WeakKey` / `TooLarge` before anything is touched
    /// - `Quota`, `Lock`, `Path` from the preparation steps
    /// - `Io` when the plaintext cannot be staged
    /// - `Cipher` when the encryptor fails; the target is unchanged
    /// - `Permission` when owner-only permissions cannot be confirmed
    pub fn write_encrypted(
        &self,
        target: &ValidatedPath,
        key: &EncryptionKey,
        content: &[u8],
    ) -> Result<(), WriteError> {
        if key.is_weak() {
            return Err(WriteError::WeakKey);
        }
        let size = content.len() as u64;
        if size > MAX_CONTENT_SIZE {
            return Err(WriteError::TooLarge {
                size,
                max: MAX_CONTENT_SIZE,
            });
        }

        let _lock = self.locks.try_lock(target, self.lock_timeout)?;
        let temp = self.temp_files.create_for(Some("write"), size)?;
        temp.write_all(content)?;

        self.validator.create_parent_dirs(target)?;
        let target = self.validator.revalidate(target)?;

        let staging = staging_path(target.as_path());
        let staging_guard = defer(|| {
            if fs::symlink_metadata(&staging).is_ok() {
                let _ = fs::remove_file(&staging);
            }
        });

        let encrypted = self
            .encryptor
            .encrypt_file(key, temp.path().as_path(), &staging);
        // Plaintext goes away whether or not the cipher succeeded.
        drop(temp);
        encrypted?;

        if !owner_only_verified(self.ops.as_ref(), &staging) {
            return Err(WriteError::Permission(target.to_path_buf()));
        }

        fs::rename(&staging, target.as_path())?;
        staging_guard.disarm();

        // On failure the published artifact stays; the caller decides.
        if !owner_only_verified(self.ops.as_ref(), target.as_path()) {
            return Err(WriteError::Permission(target.to_path_buf()));
        }

        tracing::debug!(path = %target, bytes = size, "Encrypted write published");
        Ok(())
    }
}

#[derive(Clone)]
pub struct AtomicEncryptedReader {
    temp_files: SecureTempFileManager,
    locks: Arc<LockRegistry>,
    validator: PathValidator,
    decryptor: Arc<dyn Decryptor>,
    lock_timeout: Duration,
}

impl AtomicEncryptedReader {
    pub fn new(
        temp_files: SecureTempFileManager,
        locks: Arc<LockRegistry>,
        validator: PathValidator,
        decryptor: Arc<dyn Decryptor>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            temp_files,
            locks,
            validator,
            decryptor,
            lock_timeout,
        }
    }

    /// Decrypt `source` and return the plaintext.
    ///
    /// A missing source is `NotFound`; whether that means "no data yet" is
    /// the caller's call.
    pub fn read_encrypted(
        &self,
        source: &ValidatedPath,
        key: &EncryptionKey,
    ) -> Result<Vec<u8>, ReadError> {
        if key.is_weak() {
            return Err(ReadError::WeakKey);
        }
        if !source.exists() {
            return Err(ReadError::NotFound(source.to_path_buf()));
        }

        let _lock = self.locks.try_lock(source, self.lock_timeout)?;
        let source = self.validator.revalidate(source).map_err(ReadError::Path)?;

        let encrypted_size = fs::metadata(source.as_path())?.len();
        if encrypted_size > MAX_ENCRYPTED_FILE_SIZE {
            return Err(ReadError::ContentTooLarge {
                size: encrypted_size,
                max: MAX_ENCRYPTED_FILE_SIZE,
            });
        }

        self.temp_files
            .quota()
            .can_decrypt_to_temp(source.as_path(), self.temp_files.user())?;
        let temp = self
            .temp_files
            .create_for(Some("read"), decrypted_estimate(encrypted_size))?;

        self.decryptor
            .decrypt_file(key, source.as_path(), temp.path().as_path())?;

        let mut content = temp.read_limited(MAX_CONTENT_SIZE)?;
        drop(temp);

        let size = content.len() as u64;
        if size > MAX_CONTENT_SIZE {
            content.fill(0);
            return Err(ReadError::ContentTooLarge {
                size,
                max: MAX_CONTENT_SIZE,
            });
        }

        tracing::debug!(path = %source, bytes = size, "Encrypted read completed");
        Ok(content)
    }
}
