// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Configuration
//!
//! Fixed policy constants for the secure storage layer plus the small amount
//! of runtime configuration that is loaded from the environment.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Root directory holding every user's files | `./data` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info` |

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::quota::QuotaLimits;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Environment variable name for the data root.
pub const DATA_DIR_ENV: &str = "DATA_DIR";

/// Environment variable selecting the log formatter (`json` or `pretty`).
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Data root used when `DATA_DIR` is not set.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Largest plaintext accepted by the writer or returned by the reader.
pub const MAX_CONTENT_SIZE: u64 = 50 * MIB;

/// Largest ciphertext the reader will attempt to decrypt.
pub const MAX_ENCRYPTED_FILE_SIZE: u64 = 50 * MIB;

/// Upper bound on the aggregate size of a user's temp directory.
pub const MAX_TEMP_DIRECTORY_SIZE: u64 = 20 * GIB;

/// Temp directory size above which an opportunistic cleanup pass runs (80%).
pub const TEMP_CLEANUP_THRESHOLD: u64 = 16 * GIB;

/// Free space that must remain on the data volume after a reservation.
pub const MIN_DISK_SPACE_REQUIRED: u64 = GIB;

/// Owner read/write only.
pub const FILE_MODE: u32 = 0o600;

/// Owner read/write/execute only.
pub const DIR_MODE: u32 = 0o700;

/// Decrypted output is estimated at 110% of the ciphertext size.
pub const DECRYPT_SIZE_PERCENT: u64 = 110;

/// Name of the per-user scratch directory.
pub const TEMP_DIR_NAME: &str = "Temp";

/// How long writers and readers wait for a contended advisory lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Overwrite passes used when a caller asks for secure deletion.
pub const DEFAULT_SECURE_DELETE_PASSES: u32 = 3;

/// Runtime configuration for a [`StorageContext`](crate::storage::StorageContext).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Root under which `<user>/` directories live.
    pub data_root: PathBuf,
    /// Temp directory and disk space limits.
    pub quota: QuotaLimits,
    /// Wait applied by the writer/reader when the target is locked.
    pub lock_timeout: Duration,
    /// Passes used by `delete_file(.., secure = true)`.
    pub secure_delete_passes: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}

impl StorageConfig {
    /// Configuration with default policy rooted at `data_root`.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
            quota: QuotaLimits::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            secure_delete_passes: DEFAULT_SECURE_DELETE_PASSES,
        }
    }

    /// Load from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let data_root = env::var(DATA_DIR_ENV).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        Self::new(data_root)
    }

    pub fn with_quota(mut self, quota: QuotaLimits) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}
