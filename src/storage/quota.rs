// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Temp directory quota and free-disk floor.
//!
//! There is no cached counter: every check walks the user's temp directory.
//! The walk is not atomic with the file creation it gates, so two callers
//! racing for the last bytes of quota can both pass. That window is
//! accepted; the disk floor still bounds the damage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;

use super::deleter::SecureDeleter;
use super::os_ops::OsFileOps;
use super::paths::StoragePaths;
use super::temp::ActiveTempFiles;
use crate::config::{
    DECRYPT_SIZE_PERCENT, MAX_TEMP_DIRECTORY_SIZE, MIN_DISK_SPACE_REQUIRED, TEMP_CLEANUP_THRESHOLD,
};
use crate::error::QuotaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaLimits {
    pub max_size: u64,
    pub cleanup_threshold: u64,
    pub min_free_disk: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            max_size: MAX_TEMP_DIRECTORY_SIZE,
            cleanup_threshold: TEMP_CLEANUP_THRESHOLD,
            min_free_disk: MIN_DISK_SPACE_REQUIRED,
        }
    }
}

impl QuotaLimits {
    pub fn new(max_size: u64, cleanup_threshold: u64, min_free_disk: u64) -> Self {
        Self {
            max_size,
            cleanup_threshold,
            min_free_disk,
        }
    }
}

/// Result of one live scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaState {
    pub current_size: u64,
    pub max_size: u64,
    pub cleanup_threshold: u64,
    pub min_free_disk: u64,
}

impl QuotaState {
    pub fn over_threshold(&self) -> bool {
        self.current_size > self.cleanup_threshold
    }
}

struct TempEntry {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct TempDirectoryQuotaManager {
    paths: StoragePaths,
    limits: QuotaLimits,
    ops: Arc<dyn OsFileOps>,
    deleter: SecureDeleter,
    active: Arc<ActiveTempFiles>,
}

impl TempDirectoryQuotaManager {
    pub fn new(
        paths: StoragePaths,
        limits: QuotaLimits,
        ops: Arc<dyn OsFileOps>,
        deleter: SecureDeleter,
        active: Arc<ActiveTempFiles>,
    ) -> Self {
        Self {
            paths,
            limits,
            ops,
            deleter,
            active,
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Current usage of `user`'s temp directory.
    pub fn state(&self, user: &str) -> Result<QuotaState, QuotaError> {
        let current_size = directory_size(&self.paths.temp_dir(user))?;
        Ok(QuotaState {
            current_size,
            max_size: self.limits.max_size,
            cleanup_threshold: self.limits.cleanup_threshold,
            min_free_disk: self.limits.min_free_disk,
        })
    }

    /// Gate a temp file of `estimated_bytes` for `user`.
    ///
    /// Fails with `QuotaExceeded` when the temp directory would outgrow its
    /// limit even after cleanup, and with `InsufficientDisk` when the data
    /// volume would drop below the free-space floor.
    pub fn check_and_reserve(&self, estimated_bytes: u64, user: &str) -> Result<QuotaState, QuotaError> {
        let temp_dir = self.paths.temp_dir(user);
        let mut state = self.state(user)?;

        if state.current_size.saturating_add(estimated_bytes) > self.limits.max_size {
            let freed = self.cleanup_oldest(&temp_dir, estimated_bytes)?;
            tracing::info!(user, freed, requested = estimated_bytes, "Temp quota cleanup");
            state = self.state(user)?;
            if state.current_size.saturating_add(estimated_bytes) > self.limits.max_size {
                return Err(QuotaError::QuotaExceeded {
                    current: state.current_size,
                    requested: estimated_bytes,
                    max: self.limits.max_size,
                });
            }
        } else if state.over_threshold() {
            let excess = state.current_size - self.limits.cleanup_threshold;
            match self.cleanup_oldest(&temp_dir, excess) {
                Ok(freed) => {
                    tracing::info!(user, freed, "Opportunistic temp cleanup");
                    state = self.state(user)?;
                }
                Err(e) => tracing::warn!(user, error = %e, "Opportunistic temp cleanup failed"),
            }
        }

        let available = self.ops.available_space(self.paths.root())?;
        if available.saturating_sub(estimated_bytes) < self.limits.min_free_disk
            || available < estimated_bytes
        {
            return Err(QuotaError::InsufficientDisk {
                available,
                requested: estimated_bytes,
                min_free: self.limits.min_free_disk,
            });
        }

        Ok(state)
    }

    /// Quota check for decrypting `source` into a temp file.
    pub fn can_decrypt_to_temp(&self, source: &Path, user: &str) -> Result<QuotaState, QuotaError> {
        let encrypted = fs::metadata(source)?.len();
        self.check_and_reserve(decrypted_estimate(encrypted), user)
    }

    /// Delete temp files oldest-modified first until `target_bytes` are
    /// freed or no candidates remain. Files owned by a live handle are
    /// skipped. Returns the bytes freed.
    pub fn cleanup_oldest(&self, temp_dir: &Path, target_bytes: u64) -> Result<u64, QuotaError> {
        let mut entries = Vec::new();
        collect_files(temp_dir, &mut entries)?;
        entries.sort_by_key(|e| e.modified);

        let mut freed = 0u64;
        for entry in entries {
            if freed >= target_bytes {
                break;
            }
            if self.active.contains(&entry.path) {
                continue;
            }
            if self.deleter.quick_delete(&entry.path) {
                freed = freed.saturating_add(entry.size);
            }
        }
        Ok(freed)
    }
}

/// Plaintext size assumed for `encrypted_size` bytes of ciphertext, rounded up.
pub fn decrypted_estimate(encrypted_size: u64) -> u64 {
    encrypted_size
        .saturating_mul(DECRYPT_SIZE_PERCENT)
        .div_ceil(100)
}

/// Recursive sum of file sizes; a missing directory is empty.
pub fn directory_size(dir: &Path) -> io::Result<u64> {
    let mut entries = Vec::new();
    collect_files(dir, &mut entries)?;
    Ok(entries.iter().map(|e| e.size).sum())
}

fn collect_files(dir: &Path, out: &mut Vec<TempEntry>) -> io::Result<()> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in read_dir {
        let entry = entry?;
        // Entries can vanish mid-walk when another operation cleans up.
        let meta = match entry.path().symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if meta.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if meta.is_file() {
            out.push(TempEntry {
                path: entry.path(),
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
    }
    Ok(())
}
