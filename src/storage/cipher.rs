// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Boundary traits for the external cipher and structural validators.
//!
//! The cipher construction lives outside this crate. Implementations must
//! be all-or-nothing with respect to `dest`: either it ends up holding the
//! complete output or the call fails. The writer still stages the output
//! and renames it into place, so a misbehaving encryptor cannot clobber an
//! existing target.

use std::path::Path;

use super::key::EncryptionKey;
use super::ValidatedPath;
use crate::error::CipherError;

pub type CipherResult = Result<(), CipherError>;

pub trait Encryptor: Send + Sync {
    /// Encrypt the plaintext at `source` into `dest`.
    fn encrypt_file(&self, key: &EncryptionKey, source: &Path, dest: &Path) -> CipherResult;
}

pub trait Decryptor: Send + Sync {
    /// Decrypt the ciphertext at `source` into the plaintext file `dest`.
    fn decrypt_file(&self, key: &EncryptionKey, source: &Path, dest: &Path) -> CipherResult;
}

/// Optional structural check ("is this a well-formed task list") used by
/// higher layers after a read. The core never calls it.
pub trait TypeValidator: Send + Sync {
    fn validate(&self, path: &ValidatedPath, file_type: &str) -> bool;
}

impl<F> TypeValidator for F
where
    F: Fn(&ValidatedPath, &str) -> bool + Send + Sync,
{
    fn validate(&self, path: &ValidatedPath, file_type: &str) -> bool {
        self(path, file_type)
    }
}
