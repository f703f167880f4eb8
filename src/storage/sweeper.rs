// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Temp Sweeper
//!
//! Background task that keeps a user's scratch space tidy between
//! operations. Every `interval` (default 60 s) it:
//! 1. Runs one pass over the pending-deletion queue.
//! 2. Removes orphaned temp files older than `max_age` (default 1 h).
//!
//! The first sweep runs immediately, which is what clears plaintext left by
//! a previous process that crashed mid-operation.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken` for graceful shutdown.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::StorageContext;

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_ORPHAN_MAX_AGE: Duration = Duration::from_secs(60 * 60);

pub struct TempSweeper {
    context: StorageContext,
    interval: Duration,
    max_age: Duration,
}

impl TempSweeper {
    pub fn new(context: StorageContext) -> Self {
        Self {
            context,
            interval: DEFAULT_SWEEP_INTERVAL,
            max_age: DEFAULT_ORPHAN_MAX_AGE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Temp files younger than this are assumed to belong to an operation
    /// in another process and are left alone.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// ```rust,ignore
    /// tokio::spawn(TempSweeper::new(ctx.clone()).run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            user = %self.context.user(),
            interval_secs = self.interval.as_secs(),
            max_age_secs = self.max_age.as_secs(),
            "Temp sweeper starting"
        );

        loop {
            if shutdown.is_cancelled() {
                info!("Temp sweeper shutting down");
                return;
            }

            self.sweep_step().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => {
                    info!("Temp sweeper shutting down");
                    return;
                }
            }
        }
    }

    async fn sweep_step(&self) {
        let context = self.context.clone();
        let max_age = self.max_age;
        // Deletion overwrites file contents; keep it off the async workers.
        let result = tokio::task::spawn_blocking(move || {
            let remaining = context.process_pending_deletions();
            let removed = context.cleanup_orphaned_temp_files(max_age);
            (remaining, removed)
        })
        .await;

        match result {
            Ok((remaining, Ok(removed))) => {
                if remaining > 0 || removed > 0 {
                    info!(remaining, removed, "Temp sweep finished");
                }
            }
            Ok((_, Err(e))) => warn!(error = %e, "Orphaned temp sweep failed"),
            Err(e) => warn!(error = %e, "Temp sweep task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::test_context;
    use std::fs;

    #[tokio::test]
    async fn first_sweep_runs_immediately_and_shutdown_stops_the_loop() {
        let (_dir, ctx) = test_context();
        let orphan = ctx.temp_files().temp_dir().join("crashed.tmp");
        fs::write(&orphan, b"plaintext").unwrap();

        let shutdown = CancellationToken::new();
        let sweeper = TempSweeper::new(ctx.clone())
            .with_interval(Duration::from_millis(10))
            .with_max_age(Duration::ZERO);
        let task = tokio::spawn(sweeper.run(shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while orphan.exists() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!orphan.exists());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_before_start_does_nothing() {
        let (_dir, ctx) = test_context();
        let orphan = ctx.temp_files().temp_dir().join("crashed.tmp");
        fs::write(&orphan, b"plaintext").unwrap();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        TempSweeper::new(ctx)
            .with_max_age(Duration::ZERO)
            .run(shutdown)
            .await;
        assert!(orphan.exists());
    }
}
