// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Advisory locks over canonical paths.
//!
//! Only participants that go through the same [`LockRegistry`] are
//! serialized; nothing stops another process from writing the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::ValidatedPath;
use crate::error::LockError;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Holders = Mutex<HashMap<PathBuf, Uuid>>;

/// Registry mapping canonical path to the current holder.
#[derive(Debug, Default)]
pub struct LockRegistry {
    holders: Arc<Holders>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `path`.
    ///
    /// A zero timeout fails at once with `AlreadyLocked`; otherwise the
    /// registry is polled until `timeout` elapses. Paths that do not exist
    /// yet are not registered and always succeed.
    pub fn try_lock(&self, path: &ValidatedPath, timeout: Duration) -> Result<FileLock, LockError> {
        let canonical = path.to_path_buf();
        if !path.exists() {
            tracing::debug!(path = %canonical.display(), "Lock on missing file granted trivially");
            return Ok(FileLock::unregistered(canonical));
        }

        let holder = Uuid::new_v4();
        let deadline = Instant::now() + timeout;
        loop {
            if self.insert_if_free(&canonical, holder) {
                tracing::debug!(path = %canonical.display(), %holder, "Lock acquired");
                return Ok(FileLock {
                    path: canonical,
                    holder,
                    registry: Some(Arc::clone(&self.holders)),
                });
            }
            if timeout.is_zero() {
                return Err(LockError::AlreadyLocked(canonical));
            }
            if Instant::now() >= deadline {
                return Err(LockError::Timeout(canonical));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Release `lock`; same as dropping it.
    pub fn unlock(&self, mut lock: FileLock) {
        lock.unlock();
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        lock_holders(&self.holders).contains_key(path)
    }

    /// Snapshot of currently held paths.
    pub fn active_locks(&self) -> Vec<PathBuf> {
        lock_holders(&self.holders).keys().cloned().collect()
    }

    fn insert_if_free(&self, path: &Path, holder: Uuid) -> bool {
        let mut holders = lock_holders(&self.holders);
        if holders.contains_key(path) {
            return false;
        }
        holders.insert(path.to_path_buf(), holder);
        true
    }
}

fn lock_holders(holders: &Holders) -> MutexGuard<'_, HashMap<PathBuf, Uuid>> {
    holders.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A held advisory lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    holder: Uuid,
    registry: Option<Arc<Holders>>,
}

impl FileLock {
    fn unregistered(path: PathBuf) -> Self {
        Self {
            path,
            holder: Uuid::nil(),
            registry: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Whether this lock occupies a registry slot.
    pub fn is_registered(&self) -> bool {
        self.registry.is_some()
    }

    /// Idempotent release.
    pub fn unlock(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };
        let mut holders = lock_holders(&registry);
        if holders.get(&self.path) == Some(&self.holder) {
            holders.remove(&self.path);
            tracing::debug!(path = %self.path.display(), holder = %self.holder, "Lock released");
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}
