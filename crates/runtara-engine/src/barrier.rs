// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One-shot startup barrier.
//!
//! The first caller runs the setup; every concurrent caller waits on a watch
//! channel until the setup settled. A failed setup is remembered and returned to
//! every later caller.

use std::future::Future;

use tokio::sync::watch;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum BarrierState {
    Idle,
    Initializing,
    Ready,
    Failed(String),
}

/// Readiness flag plus deferred callers.
#[derive(Debug)]
pub struct StartupBarrier {
    state: watch::Sender<BarrierState>,
}

impl Default for StartupBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupBarrier {
    /// Create a barrier that has not run yet.
    pub fn new() -> Self {
        let (state, _) = watch::channel(BarrierState::Idle);
        Self { state }
    }

    /// Whether setup completed successfully.
    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == BarrierState::Ready
    }

    /// Run `setup` if nobody has yet, otherwise wait for the run in progress.
    ///
    /// If the caller running the setup is dropped before it settles, the
    /// barrier returns to idle and one of the waiting callers runs it instead.
    pub async fn wait_or_run<F, Fut>(&self, setup: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        loop {
            let claimed = self.state.send_if_modified(|state| {
                if *state == BarrierState::Idle {
                    *state = BarrierState::Initializing;
                    true
                } else {
                    false
                }
            });

            if claimed {
                let mut claim = Claim {
                    state: &self.state,
                    settled: false,
                };
                let outcome = setup().await;
                let next = match &outcome {
                    Ok(()) => BarrierState::Ready,
                    Err(e) => BarrierState::Failed(e.to_string()),
                };
                self.state.send_replace(next);
                claim.settled = true;
                return outcome;
            }

            let mut rx = self.state.subscribe();
            let settled = rx
                .wait_for(|state| *state != BarrierState::Initializing)
                .await
                .map_err(|e| EngineError::DatabaseError {
                    operation: "setup".to_string(),
                    details: e.to_string(),
                })?
                .clone();

            match settled {
                BarrierState::Ready => return Ok(()),
                BarrierState::Failed(reason) => {
                    return Err(EngineError::DatabaseError {
                        operation: "setup".to_string(),
                        details: reason,
                    });
                }
                // The previous claimant was dropped; try to claim again.
                BarrierState::Idle | BarrierState::Initializing => continue,
            }
        }
    }
}

/// Held by the caller running the setup. Dropping it unsettled releases the
/// barrier.
struct Claim<'a> {
    state: &'a watch::Sender<BarrierState>,
    settled: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.state.send_replace(BarrierState::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_setup_runs_once_for_concurrent_callers() {
        let barrier = Arc::new(StartupBarrier::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let barrier = barrier.clone();
            let runs = runs.clone();
            handles.push(tokio::spawn(async move {
                barrier
                    .wait_or_run(|| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(barrier.is_ready());
    }

    #[tokio::test]
    async fn test_failed_setup_is_reported_to_later_callers() {
        let barrier = StartupBarrier::new();

        let first = barrier
            .wait_or_run(|| async {
                Err(EngineError::DatabaseError {
                    operation: "setup".to_string(),
                    details: "disk full".to_string(),
                })
            })
            .await;
        assert!(first.is_err());

        let second = barrier.wait_or_run(|| async { Ok(()) }).await;
        let err = second.unwrap_err();
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(err.to_string().contains("disk full"));
        assert!(!barrier.is_ready());
    }

    #[tokio::test]
    async fn test_dropped_setup_is_taken_over_by_waiter() {
        let barrier = Arc::new(StartupBarrier::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let first = tokio::spawn({
            let barrier = barrier.clone();
            async move {
                barrier
                    .wait_or_run(|| std::future::pending::<Result<()>>())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = tokio::spawn({
            let barrier = barrier.clone();
            let runs = runs.clone();
            async move {
                barrier
                    .wait_or_run(|| async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        first.abort();
        let _ = first.await;

        tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .expect("waiter hung after the setup was dropped")
            .unwrap()
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(barrier.is_ready());

        // Later callers see the settled state.
        barrier.wait_or_run(|| async { Ok(()) }).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
