// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Path layout for per-user storage.
//!
//! ```text
//! <data_root>/
//!   <user>/
//!     ...          # user files (ciphertext only)
//!     Temp/        # plaintext scratch space, quota-bounded
//! ```

use std::path::{Path, PathBuf};

use crate::config::TEMP_DIR_NAME;

/// Storage path utilities rooted at the data directory.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory for all users.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owning everything for `user`.
    pub fn user_dir(&self, user: &str) -> PathBuf {
        self.root.join(user)
    }

    /// Scratch directory for `user`.
    pub fn temp_dir(&self, user: &str) -> PathBuf {
        self.user_dir(user).join(TEMP_DIR_NAME)
    }

    /// Path of a scratch file relative to the user directory.
    pub fn temp_relative(file_name: &str) -> String {
        format!("{TEMP_DIR_NAME}/{file_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_layout_is_correct() {
        let paths = StoragePaths::new("/tmp/test-data");
        assert_eq!(paths.root(), Path::new("/tmp/test-data"));
        assert_eq!(paths.user_dir("alice"), PathBuf::from("/tmp/test-data/alice"));
        assert_eq!(
            paths.temp_dir("alice"),
            PathBuf::from("/tmp/test-data/alice/Temp")
        );
    }

    #[test]
    fn temp_relative_is_under_temp_dir() {
        assert_eq!(StoragePaths::temp_relative("x.tmp"), "Temp/x.tmp");
    }
}
