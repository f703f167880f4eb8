// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Quota-checked, owner-only scratch files.
//!
//! A [`TempFileHandle`] deletes its file when dropped, on every exit path,
//! unless [`TempFileHandle::disarm`] handed the file to someone else. While
//! a handle is alive its path sits in [`ActiveTempFiles`] so quota cleanup
//! and the orphan sweep leave it alone.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use super::deleter::SecureDeleter;
use super::os_ops::{EntryKind, OsFileOps};
use super::paths::StoragePaths;
use super::quota::TempDirectoryQuotaManager;
use super::validation::{PathValidator, ValidatedPath};
use crate::config::MAX_CONTENT_SIZE;
use crate::error::TempFileError;

/// Size assumed by [`SecureTempFileManager::create`] when the caller has no
/// better estimate.
pub const DEFAULT_TEMP_ESTIMATE: u64 = MAX_CONTENT_SIZE;

const MAX_HINT_LEN: usize = 32;
const DEFAULT_HINT: &str = "secure";

/// Paths of temp files currently owned by a live handle.
#[derive(Debug, Default)]
pub struct ActiveTempFiles {
    paths: Mutex<HashSet<PathBuf>>,
}

impl ActiveTempFiles {
    fn paths(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, path: PathBuf) {
        self.paths().insert(path);
    }

    pub fn remove(&self, path: &Path) {
        self.paths().remove(path);
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths().contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.paths().iter().cloned().collect()
    }
}

/// One scratch file, deleted on drop unless disarmed.
#[derive(Debug)]
pub struct TempFileHandle {
    path: ValidatedPath,
    deleter: SecureDeleter,
    ops: Arc<dyn OsFileOps>,
    active: Arc<ActiveTempFiles>,
    armed: bool,
}

impl TempFileHandle {
    fn new(
        path: ValidatedPath,
        deleter: SecureDeleter,
        ops: Arc<dyn OsFileOps>,
        active: Arc<ActiveTempFiles>,
    ) -> Self {
        active.insert(path.to_path_buf());
        Self {
            path,
            deleter,
            ops,
            active,
            armed: true,
        }
    }

    pub fn path(&self) -> &ValidatedPath {
        &self.path
    }

    /// Replace the file contents with `data` and sync. A short write is an
    /// error; the partial file is still removed when the handle drops.
    pub fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.ops.write_synced(self.path.as_path(), data)
    }

    /// Read at most `limit + 1` bytes, so callers can tell "exactly at the
    /// limit" from "over it" without reading an unbounded file.
    pub fn read_limited(&self, limit: u64) -> io::Result<Vec<u8>> {
        let file = File::open(self.path.as_path())?;
        let mut buf = Vec::new();
        file.take(limit.saturating_add(1)).read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Stop managing the file and hand its path to the caller, who now owns
    /// its deletion.
    pub fn disarm(mut self) -> ValidatedPath {
        self.armed = false;
        self.active.remove(self.path.as_path());
        self.path.clone()
    }
}

impl Drop for TempFileHandle {
    fn drop(&mut self) {
        if self.armed {
            self.deleter.cleanup_temp(self.path.as_path());
        }
        self.active.remove(self.path.as_path());
    }
}

/// Allocates scratch files under `<data_root>/<user>/Temp/`.
#[derive(Debug, Clone)]
pub struct SecureTempFileManager {
    user: String,
    paths: StoragePaths,
    validator: PathValidator,
    quota: TempDirectoryQuotaManager,
    deleter: SecureDeleter,
    ops: Arc<dyn OsFileOps>,
    active: Arc<ActiveTempFiles>,
}

impl SecureTempFileManager {
    /// `validator` must be rooted at the user's directory.
    pub fn new(
        user: impl Into<String>,
        paths: StoragePaths,
        validator: PathValidator,
        quota: TempDirectoryQuotaManager,
        deleter: SecureDeleter,
        ops: Arc<dyn OsFileOps>,
        active: Arc<ActiveTempFiles>,
    ) -> Self {
        Self {
            user: user.into(),
            paths,
            validator,
            quota,
            deleter,
            ops,
            active,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn quota(&self) -> &TempDirectoryQuotaManager {
        &self.quota
    }

    pub fn active(&self) -> &Arc<ActiveTempFiles> {
        &self.active
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.paths.temp_dir(&self.user)
    }

    /// Create a scratch file using the conservative default estimate.
    pub fn create(&self, hint: Option<&str>) -> Result<TempFileHandle, TempFileError> {
        self.create_for(hint, DEFAULT_TEMP_ESTIMATE)
    }

    /// Create a scratch file expected to grow to `estimated_bytes`.
    pub fn create_for(
        &self,
        hint: Option<&str>,
        estimated_bytes: u64,
    ) -> Result<TempFileHandle, TempFileError> {
        self.ensure_temp_dir()?;
        self.quota.check_and_reserve(estimated_bytes, &self.user)?;

        let name = format!("{}_{}.tmp", sanitize_hint(hint), Uuid::new_v4().simple());
        let path = self.validator.validate(&StoragePaths::temp_relative(&name))?;

        let file = create_owner_only(path.as_path())?;
        // The handle owns the file from here; any early return deletes it.
        let handle = TempFileHandle::new(
            path,
            self.deleter.clone(),
            Arc::clone(&self.ops),
            Arc::clone(&self.active),
        );
        file.sync_all()?;
        drop(file);

        let path = self.validator.revalidate(handle.path())?;
        self.ops.set_owner_only(path.as_path(), EntryKind::File)?;
        if !self.ops.has_owner_only(path.as_path(), EntryKind::File)? {
            tracing::warn!(path = %path, "Temp file permissions did not stick");
            return Err(TempFileError::Permission(path.to_path_buf()));
        }

        tracing::debug!(path = %path, estimated_bytes, "Temp file created");
        Ok(handle)
    }

    fn ensure_temp_dir(&self) -> Result<(), TempFileError> {
        let dir = self.temp_dir();
        if !dir.is_dir() {
            fs::create_dir_all(&dir)?;
        }
        self.ops.set_owner_only(&dir, EntryKind::Directory)?;
        if !self.ops.has_owner_only(&dir, EntryKind::Directory)? {
            return Err(TempFileError::Permission(dir));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_owner_only(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(crate::config::FILE_MODE)
        .open(path)
}

#[cfg(not(unix))]
fn create_owner_only(path: &Path) -> io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}

fn sanitize_hint(hint: Option<&str>) -> String {
    let cleaned: String = hint
        .unwrap_or(DEFAULT_HINT)
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_HINT_LEN)
        .collect();
    if cleaned.is_empty() {
        DEFAULT_HINT.to_string()
    } else {
        cleaned
    }
}
