// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deletion that survives locked files.
//!
//! A delete first tries a normal remove, then delete-on-close, and finally
//! parks the path in the [`CleanupQueue`]. The queue has at most one retry
//! worker in flight (single-flight flag, set 0 -> 1 on schedule, cleared
//! only when the queue drains) and the worker exits once its queue is
//! dropped. The queue is in-memory only; files still pending at exit are
//! picked up by the orphaned temp sweep on the next start.

use std::fs::{self, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::os_ops::OsFileOps;

/// Files at or below this size are removed without overwriting.
pub const SECURE_DELETE_MIN_SIZE: u64 = 0;

/// Upper bound on overwrite passes regardless of what the caller asks for.
pub const MAX_SECURE_DELETE_PASSES: u32 = 7;

/// Files smaller than this get at most two passes.
const SMALL_FILE_SIZE: u64 = 4096;

const OVERWRITE_CHUNK: usize = 64 * 1024;

/// A path whose removal failed and is awaiting retry.
#[derive(Debug, Clone, Serialize)]
pub struct PendingDeletion {
    pub path: PathBuf,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
}

/// Delay schedule for the retry worker.
#[derive(Debug, Clone)]
pub struct RetryBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `round` (0-based), doubling up to `max`.
    pub fn delay(&self, round: u32) -> Duration {
        let factor = 1u32 << round.min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Pending deletions plus the single-flight retry flag.
#[derive(Debug)]
pub struct CleanupQueue {
    pending: Mutex<Vec<PendingDeletion>>,
    /// Entries taken out by a pass that has not put its survivors back yet.
    in_flight: AtomicUsize,
    retry_scheduled: AtomicBool,
    ops: Arc<dyn OsFileOps>,
    backoff: RetryBackoff,
}

impl CleanupQueue {
    pub fn new(ops: Arc<dyn OsFileOps>) -> Arc<Self> {
        Self::with_backoff(ops, RetryBackoff::default())
    }

    pub fn with_backoff(ops: Arc<dyn OsFileOps>, backoff: RetryBackoff) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            retry_scheduled: AtomicBool::new(false),
            ops,
            backoff,
        })
    }

    fn pending(&self) -> MutexGuard<'_, Vec<PendingDeletion>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `path` and make sure a retry worker is running.
    pub fn enqueue(self: &Arc<Self>, path: &Path) {
        {
            let mut pending = self.pending();
            if !pending.iter().any(|p| p.path == path) {
                pending.push(PendingDeletion {
                    path: path.to_path_buf(),
                    enqueued_at: Utc::now(),
                    attempts: 0,
                });
            }
        }
        tracing::warn!(path = %path.display(), "Deletion obstructed, queued for retry");
        self.schedule_retry();
    }

    /// Snapshot of the queue.
    pub fn snapshot(&self) -> Vec<PendingDeletion> {
        self.pending().clone()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.pending().iter().any(|p| p.path == path)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn is_retry_scheduled(&self) -> bool {
        self.retry_scheduled.load(Ordering::Acquire)
    }

    /// Queued entries plus those held by a pass in progress.
    pub fn remaining(&self) -> usize {
        let pending = self.pending();
        pending.len() + self.in_flight.load(Ordering::Acquire)
    }

    /// One pass over the queue. Returns how many entries are still
    /// outstanding, counting any held by a concurrent pass.
    ///
    /// The queue is taken out under the lock and the I/O runs without it, so
    /// concurrent `enqueue` calls never wait on a slow delete. Whoever puts
    /// survivors back makes sure a retry worker is scheduled for them.
    pub fn process_pending_deletions(self: &Arc<Self>) -> usize {
        let batch = {
            let mut pending = self.pending();
            let batch = std::mem::take(&mut *pending);
            self.in_flight.fetch_add(batch.len(), Ordering::AcqRel);
            batch
        };
        if batch.is_empty() {
            return self.remaining();
        }

        let taken = batch.len();
        let mut survivors = Vec::new();
        let mut removed = 0usize;
        for mut entry in batch {
            if try_remove(self.ops.as_ref(), &entry.path) {
                removed += 1;
            } else {
                entry.attempts += 1;
                survivors.push(entry);
            }
        }

        let (queued, remaining) = {
            let mut pending = self.pending();
            for entry in survivors {
                if !pending.iter().any(|p| p.path == entry.path) {
                    pending.push(entry);
                }
            }
            self.in_flight.fetch_sub(taken, Ordering::AcqRel);
            let queued = pending.len();
            (queued, queued + self.in_flight.load(Ordering::Acquire))
        };
        if removed > 0 {
            tracing::info!(removed, remaining, "Processed pending deletions");
        }
        if queued > 0 {
            self.schedule_retry();
        }
        remaining
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self
            .retry_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let queue = Arc::downgrade(self);
        let spawned = match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || retry_loop(queue));
                Ok(())
            }
            Err(_) => thread::Builder::new()
                .name("pending-deletions".to_string())
                .spawn(move || retry_loop(queue))
                .map(|_| ()),
        };
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "Could not start deletion retry worker");
            self.retry_scheduled.store(false, Ordering::Release);
        }
    }
}

/// Retry until the queue drains or is dropped.
fn retry_loop(queue: Weak<CleanupQueue>) {
    let mut round = 0u32;
    loop {
        let delay = match queue.upgrade() {
            Some(q) => q.backoff.delay(round),
            None => return,
        };
        thread::sleep(delay);

        let Some(q) = queue.upgrade() else { return };
        if q.process_pending_deletions() > 0 {
            round = round.saturating_add(1);
            continue;
        }

        q.retry_scheduled.store(false, Ordering::Release);
        // An enqueue that raced the store saw the flag still set and did not
        // schedule; take the work over if we can win the flag back.
        if q.remaining() == 0
            || q.retry_scheduled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return;
        }
        round = 0;
    }
}

fn try_remove(ops: &dyn OsFileOps, path: &Path) -> bool {
    if fs::symlink_metadata(path).is_err() {
        return true;
    }
    match ops.remove_file(path) {
        Ok(()) => return true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
        Err(e) => tracing::debug!(path = %path.display(), error = %e, "Remove failed"),
    }
    match ops.mark_delete_on_close(path) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Delete-on-close failed");
            false
        }
    }
}

/// Best-effort and overwriting deletion bound to one allowed root.
#[derive(Debug, Clone)]
pub struct SecureDeleter {
    root: PathBuf,
    queue: Arc<CleanupQueue>,
    ops: Arc<dyn OsFileOps>,
}

impl SecureDeleter {
    pub fn new(root: impl Into<PathBuf>, queue: Arc<CleanupQueue>, ops: Arc<dyn OsFileOps>) -> Self {
        Self {
            root: root.into(),
            queue,
            ops,
        }
    }

    pub fn queue(&self) -> &Arc<CleanupQueue> {
        &self.queue
    }

    /// Remove `path`, queueing it when the OS refuses.
    ///
    /// Returns `true` when the file is gone or will be on last close.
    pub fn quick_delete(&self, path: &Path) -> bool {
        if try_remove(self.ops.as_ref(), path) {
            tracing::debug!(path = %path.display(), "Deleted");
            return true;
        }
        self.queue.enqueue(path);
        false
    }

    /// Overwrite the file `passes` times, then [`quick_delete`](Self::quick_delete) it.
    ///
    /// Pass `n` writes `0x00` when `n` is even and `0xFF` when odd. Paths
    /// outside the root are refused unless `allow_outside_root` is set.
    pub fn secure_delete(&self, path: &Path, passes: u32, allow_outside_root: bool) -> bool {
        if !allow_outside_root && !self.is_inside_root(path) {
            tracing::warn!(path = %path.display(), "Refusing secure delete outside root");
            return false;
        }

        let size = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => return self.quick_delete(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(_) => return self.quick_delete(path),
        };

        if size > SECURE_DELETE_MIN_SIZE {
            let passes = effective_passes(passes, size);
            if let Err(e) = overwrite(path, size, passes) {
                // Locked files usually land here; removal still gets queued.
                tracing::warn!(path = %path.display(), error = %e, "Overwrite failed");
            }
        }
        self.quick_delete(path)
    }

    /// Single-pass removal used for plaintext scratch files.
    pub fn cleanup_temp(&self, path: &Path) -> bool {
        self.secure_delete(path, 1, false)
    }

    fn is_inside_root(&self, path: &Path) -> bool {
        let parent = path.parent().unwrap_or(path);
        match (parent.canonicalize(), self.root.canonicalize()) {
            (Ok(parent), Ok(root)) => parent.starts_with(root),
            _ => path.starts_with(&self.root),
        }
    }
}

fn effective_passes(requested: u32, size: u64) -> u32 {
    let passes = requested.clamp(1, MAX_SECURE_DELETE_PASSES);
    if size < SMALL_FILE_SIZE {
        passes.min(2)
    } else {
        passes
    }
}

fn overwrite(path: &Path, size: u64, passes: u32) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    let mut buf = vec![0u8; OVERWRITE_CHUNK];

    for pass in 0..passes {
        let pattern = if pass % 2 == 0 { 0x00 } else { 0xFF };
        buf.fill(pattern);
        file.rewind()?;

        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(OVERWRITE_CHUNK as u64) as usize;
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.flush()?;
        file.sync_data()?;
    }
    Ok(())
}
