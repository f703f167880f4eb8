// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Deferred cleanup that runs on every exit path unless disarmed.

/// Runs its closure on drop. Call [`ScopeGuard::disarm`] once the guarded
/// resource has been handed off.
#[must_use = "the guard runs its cleanup as soon as it is dropped"]
pub struct ScopeGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    pub fn disarm(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Shorthand for [`ScopeGuard::new`].
pub fn defer<F: FnOnce()>(cleanup: F) -> ScopeGuard<F> {
    ScopeGuard::new(cleanup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fallible(fail: bool, ran: &Cell<bool>) -> Result<(), ()> {
        let guard = defer(|| ran.set(true));
        if fail {
            return Err(());
        }
        guard.disarm();
        Ok(())
    }

    #[test]
    fn runs_on_early_return() {
        let ran = Cell::new(false);
        assert!(fallible(true, &ran).is_err());
        assert!(ran.get());
    }

    #[test]
    fn disarmed_guard_does_nothing() {
        let ran = Cell::new(false);
        assert!(fallible(false, &ran).is_ok());
        assert!(!ran.get());
    }
}
