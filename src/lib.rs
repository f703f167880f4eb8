// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational Secure Storage - encrypted per-user file storage
//!
//! This crate sits between application code and the filesystem. It
//! validates every path against the user's directory, serializes access
//! with advisory locks, bounds plaintext scratch space with a quota, and
//! drives an injected cipher so that ciphertext replaces a file atomically
//! or not at all.
//!
//! ## Modules
//!
//! - `config` - Policy constants and environment configuration
//! - `error` - Error types (thiserror)
//! - `logging` - Tracing subscriber setup
//! - `storage` - Validation, locking, quota, temp files, encrypted I/O

pub mod config;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::StorageConfig;
pub use error::{StorageError, StorageResult};
pub use storage::{StorageContext, StorageContextBuilder};
