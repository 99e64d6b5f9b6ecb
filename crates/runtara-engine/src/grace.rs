// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Grace-period guard.
//!
//! Bounds how long work may run before the actor arranges to be woken again by
//! the host. Work is never cancelled: on expiry the guard asks its
//! [`Continuation`] to defer, and once every guarded unit has finished it asks
//! the continuation to settle.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::Result;

/// Deferred continuation armed when a grace period expires.
#[async_trait]
pub trait Continuation: Send + Sync {
    /// Arrange for the actor to be resumed later.
    async fn defer(&self) -> Result<()>;

    /// The guarded work finished; drop the deferred continuation.
    async fn settle(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct GuardState {
    in_flight: usize,
    outstanding: bool,
}

/// Soft execution-time guard with at most one outstanding grace period.
#[derive(Debug)]
pub struct GracePeriodGuard {
    timeout: Duration,
    state: Mutex<GuardState>,
}

impl GracePeriodGuard {
    /// Create a guard with the given grace-period timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(GuardState::default()),
        }
    }

    /// The configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of guarded units currently running.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Whether a grace period is outstanding.
    pub fn is_outstanding(&self) -> bool {
        self.lock().outstanding
    }

    /// Run `work` to completion under the guard.
    pub async fn run<F, T>(&self, work: F, continuation: &dyn Continuation) -> T
    where
        F: Future<Output = T>,
    {
        self.lock().in_flight += 1;

        tokio::pin!(work);
        let output = tokio::select! {
            output = &mut work => output,
            _ = tokio::time::sleep(self.timeout) => {
                if self.claim() {
                    debug!(timeout_ms = self.timeout.as_millis() as u64, "Grace period expired, deferring");
                    if let Err(e) = continuation.defer().await {
                        warn!(error = %e, "Failed to arm deferred continuation");
                    }
                }
                work.await
            }
        };

        if self.release()
            && let Err(e) = continuation.settle().await
        {
            warn!(error = %e, "Failed to settle deferred continuation");
        }

        output
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark a grace period outstanding; false if one already is.
    fn claim(&self) -> bool {
        let mut state = self.lock();
        if state.outstanding {
            return false;
        }
        state.outstanding = true;
        true
    }

    /// Leave the guard; true if the outstanding grace period ends here.
    fn release(&self) -> bool {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.in_flight == 0 && state.outstanding {
            state.outstanding = false;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingContinuation {
        deferred: AtomicUsize,
        settled: AtomicUsize,
    }

    #[async_trait]
    impl Continuation for CountingContinuation {
        async fn defer(&self) -> Result<()> {
            self.deferred.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn settle(&self) -> Result<()> {
            self.settled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_work_does_not_defer() {
        let guard = GracePeriodGuard::new(Duration::from_secs(10));
        let continuation = CountingContinuation::default();

        let value = guard.run(async { 7 }, &continuation).await;

        assert_eq!(value, 7);
        assert_eq!(continuation.deferred.load(Ordering::SeqCst), 0);
        assert_eq!(continuation.settled.load(Ordering::SeqCst), 0);
        assert_eq!(guard.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_work_defers_and_is_not_cancelled() {
        let guard = GracePeriodGuard::new(Duration::from_secs(1));
        let continuation = CountingContinuation::default();

        let value = guard
            .run(
                async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "done"
                },
                &continuation,
            )
            .await;

        assert_eq!(value, "done");
        assert_eq!(continuation.deferred.load(Ordering::SeqCst), 1);
        assert_eq!(continuation.settled.load(Ordering::SeqCst), 1);
        assert!(!guard.is_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nested_work_keeps_single_grace_period() {
        let guard = GracePeriodGuard::new(Duration::from_secs(1));
        let continuation = CountingContinuation::default();

        guard
            .run(
                async {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    guard
                        .run(
                            async {
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            },
                            &continuation,
                        )
                        .await;
                    // Outer unit still running, so the grace period stays open.
                    assert!(guard.is_outstanding());
                },
                &continuation,
            )
            .await;

        assert_eq!(continuation.deferred.load(Ordering::SeqCst), 1);
        assert_eq!(continuation.settled.load(Ordering::SeqCst), 1);
        assert_eq!(guard.in_flight(), 0);
    }
}
