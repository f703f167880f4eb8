// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Shared fixtures for storage tests.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use super::cipher::{CipherResult, Decryptor, Encryptor};
use super::key::EncryptionKey;
use super::os_ops::{EntryKind, NativeFileOps, OsFileOps};
use super::quota::QuotaLimits;
use super::{StorageContext, StorageContextBuilder};
use crate::config::{StorageConfig, MAX_CONTENT_SIZE};
use crate::error::CipherError;

pub const TEST_USER: &str = "alice";

/// Real filesystem underneath, with knobs for the failures the OS only
/// produces under contention or on exotic volumes.
#[derive(Debug)]
pub struct FakeOps {
    locked: Mutex<HashSet<PathBuf>>,
    locked_patterns: Mutex<Vec<String>>,
    delete_on_close: AtomicBool,
    available: AtomicU64,
    available_fails: AtomicBool,
    permissions_fail: AtomicBool,
    permission_patterns: Mutex<Vec<String>>,
    remove_delay: Mutex<Duration>,
    short_write: Mutex<Option<usize>>,
}

impl Default for FakeOps {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeOps {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(HashSet::new()),
            locked_patterns: Mutex::new(Vec::new()),
            delete_on_close: AtomicBool::new(false),
            available: AtomicU64::new(u64::MAX / 2),
            available_fails: AtomicBool::new(false),
            permissions_fail: AtomicBool::new(false),
            permission_patterns: Mutex::new(Vec::new()),
            remove_delay: Mutex::new(Duration::ZERO),
            short_write: Mutex::new(None),
        }
    }

    /// Make removal of `path` fail as if another process held it open.
    pub fn lock_file(&self, path: &Path) {
        self.locked.lock().unwrap().insert(path.to_path_buf());
    }

    pub fn unlock_file(&self, path: &Path) {
        self.locked.lock().unwrap().remove(path);
    }

    /// Lock every file whose name contains `fragment`.
    pub fn lock_paths_containing(&self, fragment: &str) {
        self.locked_patterns.lock().unwrap().push(fragment.to_string());
    }

    pub fn allow_delete_on_close(&self, allow: bool) {
        self.delete_on_close.store(allow, Ordering::SeqCst);
    }

    pub fn set_available_space(&self, bytes: u64) {
        self.available.store(bytes, Ordering::SeqCst);
    }

    pub fn fail_available_space(&self) {
        self.available_fails.store(true, Ordering::SeqCst);
    }

    /// Report every permission read-back as not owner-only.
    pub fn fail_permission_verification(&self, fail: bool) {
        self.permissions_fail.store(fail, Ordering::SeqCst);
    }

    /// Report permission read-back as failed for names containing `fragment`.
    pub fn fail_permission_verification_for(&self, fragment: &str) {
        self.permission_patterns
            .lock()
            .unwrap()
            .push(fragment.to_string());
    }

    /// Stall every removal, as a scanner holding the file briefly would.
    pub fn set_remove_delay(&self, delay: Duration) {
        *self.remove_delay.lock().unwrap() = delay;
    }

    /// Stop every synced write after `limit` bytes, as a full volume would.
    pub fn short_writes(&self, limit: Option<usize>) {
        *self.short_write.lock().unwrap() = limit;
    }

    fn name_matches(patterns: &Mutex<Vec<String>>, path: &Path) -> bool {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return false;
        };
        patterns.lock().unwrap().iter().any(|p| name.contains(p))
    }

    fn is_locked(&self, path: &Path) -> bool {
        self.locked.lock().unwrap().contains(path) || Self::name_matches(&self.locked_patterns, path)
    }
}

impl OsFileOps for FakeOps {
    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let delay = *self.remove_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.is_locked(path) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "file is in use by another process",
            ));
        }
        fs::remove_file(path)
    }

    fn mark_delete_on_close(&self, path: &Path) -> io::Result<()> {
        if self.delete_on_close.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("delete-on-close refused for {}", path.display()),
            ))
        }
    }

    fn set_owner_only(&self, path: &Path, kind: EntryKind) -> io::Result<()> {
        NativeFileOps.set_owner_only(path, kind)
    }

    fn has_owner_only(&self, path: &Path, kind: EntryKind) -> io::Result<bool> {
        if self.permissions_fail.load(Ordering::SeqCst)
            || Self::name_matches(&self.permission_patterns, path)
        {
            return Ok(false);
        }
        NativeFileOps.has_owner_only(path, kind)
    }

    fn write_synced(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let limit = *self.short_write.lock().unwrap();
        match limit {
            Some(limit) if limit < data.len() => {
                NativeFileOps.write_synced(path, &data[..limit])?;
                Err(io::Error::new(io::ErrorKind::WriteZero, "no space left on device"))
            }
            _ => NativeFileOps.write_synced(path, data),
        }
    }

    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        if self.available_fails.load(Ordering::SeqCst) {
            return Err(io::Error::other("statvfs failed"));
        }
        Ok(self.available.load(Ordering::SeqCst))
    }
}

fn xor_copy(key: &EncryptionKey, source: &Path, dest: &Path) -> CipherResult {
    let data = fs::read(source).map_err(|e| CipherError::new(e.to_string()))?;
    let key = key.as_bytes();
    let out: Vec<u8> = data
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()] ^ 0x5A)
        .collect();
    fs::write(dest, out).map_err(|e| CipherError::new(e.to_string()))
}

/// Keyed XOR; enough to tell ciphertext from plaintext on disk.
#[derive(Debug, Clone, Copy)]
pub struct XorCipher;

impl Encryptor for XorCipher {
    fn encrypt_file(&self, key: &EncryptionKey, source: &Path, dest: &Path) -> CipherResult {
        xor_copy(key, source, dest)
    }
}

impl Decryptor for XorCipher {
    fn decrypt_file(&self, key: &EncryptionKey, source: &Path, dest: &Path) -> CipherResult {
        xor_copy(key, source, dest)
    }
}

/// Fails without touching `dest`.
#[derive(Debug, Clone, Copy)]
pub struct FailingCipher;

impl Encryptor for FailingCipher {
    fn encrypt_file(&self, _key: &EncryptionKey, _source: &Path, _dest: &Path) -> CipherResult {
        Err(CipherError::new("encryption backend unavailable"))
    }
}

impl Decryptor for FailingCipher {
    fn decrypt_file(&self, _key: &EncryptionKey, _source: &Path, _dest: &Path) -> CipherResult {
        Err(CipherError::new("authentication tag mismatch"))
    }
}

/// Leaves a truncated `dest` behind before failing.
#[derive(Debug, Clone, Copy)]
pub struct PartialWriteCipher;

impl Encryptor for PartialWriteCipher {
    fn encrypt_file(&self, _key: &EncryptionKey, _source: &Path, dest: &Path) -> CipherResult {
        fs::write(dest, b"half-writ").map_err(|e| CipherError::new(e.to_string()))?;
        Err(CipherError::new("disk full"))
    }
}

impl Decryptor for PartialWriteCipher {
    fn decrypt_file(&self, _key: &EncryptionKey, _source: &Path, dest: &Path) -> CipherResult {
        fs::write(dest, b"half-read").map_err(|e| CipherError::new(e.to_string()))?;
        Err(CipherError::new("truncated ciphertext"))
    }
}

/// Decrypts anything into one byte more than the plaintext ceiling.
#[derive(Debug, Clone, Copy)]
pub struct ExpandingCipher;

impl Encryptor for ExpandingCipher {
    fn encrypt_file(&self, key: &EncryptionKey, source: &Path, dest: &Path) -> CipherResult {
        xor_copy(key, source, dest)
    }
}

impl Decryptor for ExpandingCipher {
    fn decrypt_file(&self, _key: &EncryptionKey, _source: &Path, dest: &Path) -> CipherResult {
        let file = fs::OpenOptions::new()
            .write(true)
            .open(dest)
            .map_err(|e| CipherError::new(e.to_string()))?;
        file.set_len(MAX_CONTENT_SIZE + 1)
            .map_err(|e| CipherError::new(e.to_string()))
    }
}

/// Context for [`TEST_USER`] over a fresh data root, using [`XorCipher`].
pub fn context_with(ops: Arc<FakeOps>, limits: QuotaLimits) -> (TempDir, StorageContext) {
    let dir = TempDir::new().unwrap();
    let ctx = StorageContextBuilder::new(StorageConfig::new(dir.path()).with_quota(limits), TEST_USER)
        .with_cipher(Arc::new(XorCipher))
        .with_os_ops(ops)
        .build()
        .unwrap();
    (dir, ctx)
}

/// [`context_with`] using default limits and plenty of reported disk.
pub fn test_context() -> (TempDir, StorageContext) {
    context_with(Arc::new(FakeOps::new()), QuotaLimits::default())
}
