// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Caller-owned 32-byte encryption keys.
//!
//! The storage layer only ever borrows a key for the length of one
//! operation. Keys never reach logs (`Debug` is redacted) and are zeroed on
//! drop.

use std::fmt;

use ring::rand::{SecureRandom, SystemRandom};

use crate::error::KeyError;

pub const KEY_LEN: usize = 32;

/// A single byte value may appear at most this many times.
const MAX_REPEATS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakKeyReason {
    AllIdentical,
    Sequential,
    RepeatedByte(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrength {
    Strong,
    Weak(WeakKeyReason),
}

pub struct EncryptionKey {
    bytes: [u8; KEY_LEN],
}

impl EncryptionKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self::new(bytes))
    }

    /// Fresh key from the system CSPRNG.
    pub fn generate() -> Result<Self, KeyError> {
        let mut bytes = [0u8; KEY_LEN];
        SystemRandom::new()
            .fill(&mut bytes)
            .map_err(|_| KeyError::RandomUnavailable)?;
        Ok(Self::new(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn strength(&self) -> KeyStrength {
        classify(&self.bytes)
    }

    pub fn is_weak(&self) -> bool {
        matches!(self.strength(), KeyStrength::Weak(_))
    }
}

fn classify(bytes: &[u8; KEY_LEN]) -> KeyStrength {
    if bytes.iter().all(|b| *b == bytes[0]) {
        return KeyStrength::Weak(WeakKeyReason::AllIdentical);
    }

    let ascending = bytes.windows(2).all(|w| w[1] == w[0].wrapping_add(1));
    let descending = bytes.windows(2).all(|w| w[1] == w[0].wrapping_sub(1));
    if ascending || descending {
        return KeyStrength::Weak(WeakKeyReason::Sequential);
    }

    let mut counts = [0usize; 256];
    for b in bytes {
        counts[*b as usize] += 1;
    }
    if let Some(value) = (0..=255u8).find(|v| counts[*v as usize] > MAX_REPEATS) {
        return KeyStrength::Weak(WeakKeyReason::RepeatedByte(value));
    }

    KeyStrength::Strong
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        for b in self.bytes.iter_mut() {
            // SAFETY: b is a valid, aligned &mut u8.
            unsafe { std::ptr::write_volatile(b, 0) };
        }
        std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
    }
}
