// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Secure Storage Module
//!
//! Confines every file operation to one user's directory and keeps
//! plaintext off the disk except in a quota-bounded, owner-only scratch
//! directory that is cleaned on every exit path.
//!
//! ## Security Model
//!
//! - Raw paths never reach the filesystem: callers get a [`ValidatedPath`]
//!   from [`PathValidator`] (traversal, encoding tricks, bidi spoofing,
//!   device names, alternate data streams, symlinks, containment)
//! - Only ciphertext is published to user paths, and only by rename
//! - Plaintext scratch files are owner-only, deleted by their handle, and
//!   retried in the background if the OS refuses
//! - Keys are borrowed per operation, rejected when weak, never logged
//! - The cipher itself is injected ([`Encryptor`] / [`Decryptor`])
//!
//! ## Storage Layout
//!
//! ```text
//! <data_root>/
//!   <user>/                 # 0700
//!     **/*.enc              # ciphertext, 0600
//!     .<name>.<id>.staging  # encryptor output, renamed over the target
//!     Temp/                 # 0700, quota-bounded
//!       <hint>_<uuid>.tmp   # plaintext, 0600, short-lived
//! ```
//!
//! ## Entry Point
//!
//! [`StorageContext`], built per user by [`StorageContextBuilder`], owns
//! the shared state (locks, cleanup queue, live temp files) and exposes
//! every operation. [`TempSweeper`] keeps the scratch directory clean in
//! the background.

pub mod cipher;
pub mod context;
pub mod deleter;
pub mod encrypted_fs;
pub mod guard;
pub mod key;
pub mod lock;
pub mod os_ops;
pub mod paths;
pub mod quota;
pub mod sweeper;
pub mod temp;
pub mod validation;

#[cfg(test)]
pub(crate) mod test_support;

pub use cipher::{CipherResult, Decryptor, Encryptor, TypeValidator};
pub use context::{StorageContext, StorageContextBuilder, StorageStatus};
pub use deleter::{CleanupQueue, PendingDeletion, SecureDeleter};
pub use encrypted_fs::{AtomicEncryptedReader, AtomicEncryptedWriter};
pub use key::{EncryptionKey, KeyStrength, WeakKeyReason};
pub use lock::{FileLock, LockRegistry};
pub use os_ops::{native_ops, EntryKind, NativeFileOps, OsFileOps};
pub use paths::StoragePaths;
pub use quota::{QuotaLimits, QuotaState, TempDirectoryQuotaManager};
pub use sweeper::TempSweeper;
pub use temp::{ActiveTempFiles, SecureTempFileManager, TempFileHandle};
pub use validation::{validate, PathValidator, ValidatedPath};
