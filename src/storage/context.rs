// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Context
//!
//! One [`StorageContext`] per user owns everything the storage operations
//! share: the path validator rooted at `<data_root>/<user>/`, the lock
//! registry, the cleanup queue and the set of live temp files. Nothing is
//! global, so two contexts (or two tests) never see each other's state.
//!
//! ```rust,ignore
//! let ctx = StorageContextBuilder::new(StorageConfig::from_env(), "alice")
//!     .with_cipher(Arc::new(cipher))
//!     .build()?;
//! let path = ctx.validate("tasks/today.enc")?;
//! ctx.write_encrypted(&path, &key, b"...")?;
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;

use super::cipher::{Decryptor, Encryptor};
use super::deleter::{CleanupQueue, PendingDeletion, SecureDeleter};
use super::encrypted_fs::{AtomicEncryptedReader, AtomicEncryptedWriter};
use super::key::EncryptionKey;
use super::lock::{FileLock, LockRegistry};
use super::os_ops::{native_ops, EntryKind, OsFileOps};
use super::paths::StoragePaths;
use super::quota::{QuotaState, TempDirectoryQuotaManager};
use super::temp::{ActiveTempFiles, SecureTempFileManager};
use super::validation::{PathValidator, ValidatedPath};
use crate::config::{StorageConfig, TEMP_DIR_NAME};
use crate::error::{
    LockError, PathError, QuotaError, ReadError, StorageError, StorageResult, WriteError,
};

const HEALTH_PROBE: &[u8] = b"storage_health_probe";

/// Point-in-time view of a context, for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub user: String,
    pub data_root: PathBuf,
    pub quota: QuotaState,
    pub pending_deletions: usize,
    pub active_locks: usize,
    pub active_temp_files: usize,
}

pub struct StorageContextBuilder {
    config: StorageConfig,
    user: String,
    encryptor: Option<Arc<dyn Encryptor>>,
    decryptor: Option<Arc<dyn Decryptor>>,
    ops: Option<Arc<dyn OsFileOps>>,
}

impl StorageContextBuilder {
    pub fn new(config: StorageConfig, user: impl Into<String>) -> Self {
        Self {
            config,
            user: user.into(),
            encryptor: None,
            decryptor: None,
            ops: None,
        }
    }

    /// Use one value for both directions.
    pub fn with_cipher<C>(mut self, cipher: Arc<C>) -> Self
    where
        C: Encryptor + Decryptor + 'static,
    {
        let encryptor: Arc<dyn Encryptor> = cipher.clone();
        let decryptor: Arc<dyn Decryptor> = cipher;
        self.encryptor = Some(encryptor);
        self.decryptor = Some(decryptor);
        self
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_decryptor(mut self, decryptor: Arc<dyn Decryptor>) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Override the platform operations (defaults to [`native_ops`]).
    pub fn with_os_ops(mut self, ops: Arc<dyn OsFileOps>) -> Self {
        self.ops = Some(ops);
        self
    }

    /// Create the user's directories and wire the components together.
    ///
    /// # Errors
    /// - `InvalidUser` if the user name is not a single safe path component
    /// - `MissingCipher` if either direction has no implementation
    /// - `Io` if the directories cannot be created or made owner-only
    pub fn build(self) -> StorageResult<StorageContext> {
        let encryptor = self.encryptor.ok_or(StorageError::MissingCipher)?;
        let decryptor = self.decryptor.ok_or(StorageError::MissingCipher)?;
        let ops = self.ops.unwrap_or_else(native_ops);

        fs::create_dir_all(&self.config.data_root)?;
        // Canonical from here on, so every path the components compare
        // (active temp files, queue entries, read_dir results) agrees.
        let root = self.config.data_root.canonicalize()?;
        validate_user_name(&root, &self.user)?;

        let paths = StoragePaths::new(&root);
        let user_dir = paths.user_dir(&self.user);
        ensure_owner_only_dir(ops.as_ref(), &user_dir)?;
        ensure_owner_only_dir(ops.as_ref(), &paths.temp_dir(&self.user))?;

        let validator = PathValidator::new(&user_dir)?;
        // Callers never address the scratch directory; only the temp
        // manager validates paths inside it.
        let user_paths = validator.clone().reserve_top_level(TEMP_DIR_NAME);
        let queue = CleanupQueue::new(Arc::clone(&ops));
        let deleter = SecureDeleter::new(validator.root(), queue, Arc::clone(&ops));
        let active = Arc::new(ActiveTempFiles::default());
        let quota = TempDirectoryQuotaManager::new(
            paths.clone(),
            self.config.quota,
            Arc::clone(&ops),
            deleter.clone(),
            Arc::clone(&active),
        );
        let temp_files = SecureTempFileManager::new(
            self.user.clone(),
            paths.clone(),
            validator.clone(),
            quota,
            deleter.clone(),
            Arc::clone(&ops),
            active,
        );
        let locks = Arc::new(LockRegistry::new());

        let writer = AtomicEncryptedWriter::new(
            temp_files.clone(),
            Arc::clone(&locks),
            user_paths.clone(),
            Arc::clone(&ops),
            encryptor,
            self.config.lock_timeout,
        );
        let reader = AtomicEncryptedReader::new(
            temp_files.clone(),
            Arc::clone(&locks),
            user_paths.clone(),
            decryptor,
            self.config.lock_timeout,
        );

        tracing::info!(user = %self.user, root = %root.display(), "Storage context ready");

        Ok(StorageContext {
            user: self.user,
            config: self.config,
            paths,
            validator: user_paths,
            locks,
            deleter,
            temp_files,
            writer,
            reader,
        })
    }
}

fn validate_user_name(root: &Path, user: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidUser(format!("{user:?}: {reason}"));

    if user.is_empty() || user == "." || user == ".." {
        return Err(invalid("not a directory name"));
    }
    if user.contains(['/', '\\']) {
        return Err(invalid("contains a path separator"));
    }
    let validated = PathValidator::new(root)?
        .validate(user)
        .map_err(|e| invalid(&e.to_string()))?;
    if validated.relative().components().count() != 1 {
        return Err(invalid("not a single path component"));
    }
    Ok(())
}

fn ensure_owner_only_dir(ops: &dyn OsFileOps, dir: &Path) -> StorageResult<()> {
    fs::create_dir_all(dir)?;
    ops.set_owner_only(dir, EntryKind::Directory)?;
    if !ops.has_owner_only(dir, EntryKind::Directory)? {
        return Err(StorageError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("could not make {} owner-only", dir.display()),
        )));
    }
    Ok(())
}

/// Per-user entry point to the secure storage layer.
#[derive(Clone)]
pub struct StorageContext {
    user: String,
    config: StorageConfig,
    paths: StoragePaths,
    validator: PathValidator,
    locks: Arc<LockRegistry>,
    deleter: SecureDeleter,
    temp_files: SecureTempFileManager,
    writer: AtomicEncryptedWriter,
    reader: AtomicEncryptedReader,
}

impl StorageContext {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Canonical `<data_root>/<user>/`.
    pub fn user_dir(&self) -> &Path {
        self.validator.root()
    }

    pub fn temp_files(&self) -> &SecureTempFileManager {
        &self.temp_files
    }

    pub fn deleter(&self) -> &SecureDeleter {
        &self.deleter
    }

    /// Confine `raw` to this user's directory. Paths into the scratch
    /// directory are refused with `ReservedDirectory`.
    pub fn validate(&self, raw: &str) -> Result<ValidatedPath, PathError> {
        self.validator.validate(raw)
    }

    pub fn write_encrypted(
        &self,
        target: &ValidatedPath,
        key: &EncryptionKey,
        content: &[u8],
    ) -> Result<(), WriteError> {
        self.writer.write_encrypted(target, key, content)
    }

    pub fn read_encrypted(
        &self,
        source: &ValidatedPath,
        key: &EncryptionKey,
    ) -> Result<Vec<u8>, ReadError> {
        self.reader.read_encrypted(source, key)
    }

    /// Delete a user file under its lock.
    ///
    /// Returns `false` when the OS refused and the path was queued for
    /// retry. `secure` overwrites with the configured number of passes
    /// first.
    pub fn delete_file(&self, path: &ValidatedPath, secure: bool) -> StorageResult<bool> {
        let _lock = self.locks.try_lock(path, self.config.lock_timeout)?;
        let path = self.validator.revalidate(path)?;
        let deleted = if secure {
            self.deleter
                .secure_delete(path.as_path(), self.config.secure_delete_passes, false)
        } else {
            self.deleter.quick_delete(path.as_path())
        };
        Ok(deleted)
    }

    pub fn try_lock(&self, path: &ValidatedPath, timeout: Duration) -> Result<FileLock, LockError> {
        self.locks.try_lock(path, timeout)
    }

    pub fn quota_state(&self) -> Result<QuotaState, QuotaError> {
        self.temp_files.quota().state(&self.user)
    }

    pub fn pending_deletions(&self) -> Vec<PendingDeletion> {
        self.deleter.queue().snapshot()
    }

    /// One retry pass over the queue; returns how many entries remain.
    pub fn process_pending_deletions(&self) -> usize {
        self.deleter.queue().process_pending_deletions()
    }

    /// Remove scratch files last modified more than `max_age` ago that no
    /// live handle owns. Returns how many were removed.
    ///
    /// The pending queue does not survive a restart; this is what picks up
    /// plaintext a crashed process left behind.
    pub fn cleanup_orphaned_temp_files(&self, max_age: Duration) -> StorageResult<usize> {
        let temp_dir = self.temp_files.temp_dir();
        let entries = match fs::read_dir(&temp_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let active = self.temp_files.active();
        let mut removed = 0usize;
        for entry in entries {
            let path = entry?.path();
            let Ok(meta) = fs::symlink_metadata(&path) else {
                continue;
            };
            if !meta.is_file() || active.contains(&path) {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            if self.deleter.cleanup_temp(&path) {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(user = %self.user, removed, "Removed orphaned temp files");
        }
        Ok(removed)
    }

    /// Write, read back and delete a probe file in the temp directory.
    pub fn health_check(&self) -> StorageResult<()> {
        let probe = self
            .temp_files
            .create_for(Some("health"), HEALTH_PROBE.len() as u64)?;
        probe.write_all(HEALTH_PROBE)?;
        let read_back = probe.read_limited(HEALTH_PROBE.len() as u64)?;
        drop(probe);

        if read_back != HEALTH_PROBE {
            return Err(StorageError::IntegrityViolation(
                "health probe read back different bytes".to_string(),
            ));
        }
        Ok(())
    }

    pub fn status(&self) -> StorageResult<StorageStatus> {
        Ok(StorageStatus {
            user: self.user.clone(),
            data_root: self.paths.root().to_path_buf(),
            quota: self.quota_state()?,
            pending_deletions: self.deleter.queue().len(),
            active_locks: self.locks.active_locks().len(),
            active_temp_files: self.temp_files.active().len(),
        })
    }
}
