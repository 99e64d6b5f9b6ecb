// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host alarm abstraction.
//!
//! Each engine actor owns exactly one alarm slot. The timer store coalesces all
//! of its armed timers into that slot; when it fires the host calls
//! [`crate::Engine::alarm`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;

/// Per-actor alarm slot provided by the host.
#[async_trait]
pub trait AlarmScheduler: Send + Sync {
    /// Program the slot, replacing any previous alarm.
    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<()>;

    /// Clear the slot.
    async fn delete_alarm(&self) -> Result<()>;

    /// The currently programmed alarm, if any.
    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Alarm slot that only records the programmed time.
///
/// Useful when the embedder drives [`crate::Engine::alarm`] itself, and in
/// tests.
#[derive(Debug, Default)]
pub struct ManualAlarm {
    slot: Mutex<Option<DateTime<Utc>>>,
}

impl ManualAlarm {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The programmed time, without going through the async trait.
    pub fn current(&self) -> Option<DateTime<Utc>> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl AlarmScheduler for ManualAlarm {
    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
        Ok(())
    }

    async fn delete_alarm(&self) -> Result<()> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.current())
    }
}

#[derive(Default)]
struct TokioSlot {
    at: Option<DateTime<Utc>>,
    handle: Option<JoinHandle<()>>,
}

/// Alarm slot backed by a tokio timer task.
///
/// Fired alarms are sent on the channel returned by [`TokioAlarm::channel`];
/// the embedder forwards each one to [`crate::Engine::alarm`].
pub struct TokioAlarm {
    slot: Arc<Mutex<TokioSlot>>,
    fired: mpsc::UnboundedSender<DateTime<Utc>>,
}

impl TokioAlarm {
    /// Create the alarm and the receiver of fired alarms.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DateTime<Utc>>) {
        let (fired, rx) = mpsc::unbounded_channel();
        let alarm = Self {
            slot: Arc::new(Mutex::new(TokioSlot::default())),
            fired,
        };
        (alarm, rx)
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl AlarmScheduler for TokioAlarm {
    async fn set_alarm(&self, at: DateTime<Utc>) -> Result<()> {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let slot = Arc::clone(&self.slot);
        let fired = self.fired.clone();

        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = guard.handle.take() {
            previous.abort();
        }

        guard.at = Some(at);
        guard.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
                if slot.at != Some(at) {
                    return;
                }
                slot.at = None;
                slot.handle = None;
            }
            debug!(at = %at, "Alarm fired");
            // Receiver gone means the embedder shut down.
            let _ = fired.send(at);
        }));

        Ok(())
    }

    async fn delete_alarm(&self) -> Result<()> {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        guard.at = None;
        if let Some(handle) = guard.handle.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).at)
    }
}
