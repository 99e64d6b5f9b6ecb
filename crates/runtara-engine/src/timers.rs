// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persisted timer store.
//!
//! Timers are event-sourced: every schedule appends an armed row and every
//! cancel or fire appends a tombstone. The active index is derived by replaying
//! the rows in ID order, and all armed timers share the single host alarm,
//! which always points at the earliest one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::alarm::AlarmScheduler;
use crate::error::{EngineError, Result};
use crate::persistence::{Persistence, TimerAction, TimerRecord};

/// What a timer is for. Part of the logical timer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerEntryType {
    /// A durable sleep in a step.
    Sleep,
    /// A delayed retry attempt.
    Retry,
    /// A step timeout.
    Timeout,
    /// The deferred continuation of a grace period.
    GracePeriod,
}

impl TimerEntryType {
    /// Integer code stored in the `entryType` column.
    pub fn code(&self) -> i64 {
        match self {
            Self::Sleep => 0,
            Self::Retry => 1,
            Self::Timeout => 2,
            Self::GracePeriod => 3,
        }
    }

    /// Parse a stored code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Sleep),
            1 => Some(Self::Retry),
            2 => Some(Self::Timeout),
            3 => Some(Self::GracePeriod),
            _ => None,
        }
    }

    /// Name used in errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sleep => "sleep",
            Self::Retry => "retry",
            Self::Timeout => "timeout",
            Self::GracePeriod => "grace_period",
        }
    }
}

impl std::fmt::Display for TimerEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An armed logical timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEntry {
    /// ID of the armed row; breaks ties between equal targets.
    pub id: i64,
    /// Timer kind.
    pub entry_type: TimerEntryType,
    /// Content hash.
    pub hash: String,
    /// Wake time.
    pub target: DateTime<Utc>,
}

/// Lowercase hex SHA-256 of `key`, used as a timer content hash.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

type TimerKey = (TimerEntryType, String);

#[derive(Debug, Clone)]
enum TimerState {
    Armed(TimerEntry),
    /// Fired or cancelled; a tombstone row exists.
    Settled,
}

/// Persisted scheduler of future wake-ups.
pub struct TimerStore {
    persistence: Arc<dyn Persistence>,
    alarm: Arc<dyn AlarmScheduler>,
    timers: Mutex<HashMap<TimerKey, TimerState>>,
}

impl TimerStore {
    /// Rebuild the store by replaying every persisted timer row.
    pub async fn load(
        persistence: Arc<dyn Persistence>,
        alarm: Arc<dyn AlarmScheduler>,
    ) -> Result<Self> {
        let rows = persistence.list_timer_rows().await?;
        let mut timers = HashMap::new();

        for row in rows {
            let (key, state) = replay_row(row)?;
            timers.insert(key, state);
        }

        let armed = timers
            .values()
            .filter(|state| matches!(state, TimerState::Armed(_)))
            .count();
        debug!(armed, "Timer store loaded");

        Ok(Self {
            persistence,
            alarm,
            timers: Mutex::new(timers),
        })
    }

    /// Arm a timer.
    ///
    /// Fails with [`EngineError::ConstraintViolation`] while the same
    /// (entry type, hash) is still armed. A settled timer may be armed again.
    #[instrument(skip(self, entry_type), fields(entry_type = %entry_type))]
    pub async fn schedule(
        &self,
        entry_type: TimerEntryType,
        hash: &str,
        target: DateTime<Utc>,
    ) -> Result<TimerEntry> {
        let mut timers = self.timers.lock().await;
        let key = (entry_type, hash.to_string());

        let id = match timers.get(&key) {
            Some(TimerState::Armed(_)) => {
                return Err(EngineError::ConstraintViolation {
                    entry_type: entry_type.as_str().to_string(),
                    hash: hash.to_string(),
                });
            }
            Some(TimerState::Settled) => {
                self.persistence
                    .rearm_timer(entry_type, hash, target)
                    .await?
            }
            None => {
                self.persistence
                    .insert_armed_timer(entry_type, hash, target)
                    .await?
            }
        };

        let entry = TimerEntry {
            id,
            entry_type,
            hash: hash.to_string(),
            target,
        };
        timers.insert(key, TimerState::Armed(entry.clone()));
        debug!(id, target = %target, "Timer armed");

        Ok(entry)
    }

    /// Cancel a timer. Unknown or already settled timers are left alone.
    ///
    /// Returns whether an armed timer was cancelled.
    #[instrument(skip(self, entry_type), fields(entry_type = %entry_type))]
    pub async fn cancel(&self, entry_type: TimerEntryType, hash: &str) -> Result<bool> {
        let mut timers = self.timers.lock().await;
        let key = (entry_type, hash.to_string());

        let Some(TimerState::Armed(entry)) = timers.get(&key) else {
            return Ok(false);
        };

        self.persistence
            .insert_tombstones(&[(entry_type, hash.to_string(), entry.target)])
            .await?;
        timers.insert(key, TimerState::Settled);

        Ok(true)
    }

    /// Take every armed timer whose target has passed.
    pub async fn pop_past_entries(&self) -> Result<Vec<TimerEntry>> {
        self.pop_entries_due_at(Utc::now()).await
    }

    /// Take every armed timer with a target at or before `now`, in
    /// (target, id) order. The returned timers are tombstoned in one
    /// transaction and will not be returned again.
    pub async fn pop_entries_due_at(&self, now: DateTime<Utc>) -> Result<Vec<TimerEntry>> {
        let mut timers = self.timers.lock().await;

        let mut due: Vec<TimerEntry> = timers
            .values()
            .filter_map(|state| match state {
                TimerState::Armed(entry) if entry.target <= now => Some(entry.clone()),
                _ => None,
            })
            .collect();

        if due.is_empty() {
            return Ok(due);
        }

        due.sort_by(|a, b| a.target.cmp(&b.target).then(a.id.cmp(&b.id)));

        let tombstones: Vec<_> = due
            .iter()
            .map(|entry| (entry.entry_type, entry.hash.clone(), entry.target))
            .collect();
        self.persistence.insert_tombstones(&tombstones).await?;

        for entry in &due {
            timers.insert(
                (entry.entry_type, entry.hash.clone()),
                TimerState::Settled,
            );
        }
        debug!(count = due.len(), "Popped due timers");

        Ok(due)
    }

    /// Point the host alarm at the earliest armed timer, or clear it when none
    /// remain. Returns the programmed time.
    pub async fn handle_next_alarm(&self) -> Result<Option<DateTime<Utc>>> {
        let next = self.active_entries().await.into_iter().next();

        match next {
            Some(entry) => {
                self.alarm.set_alarm(entry.target).await?;
                debug!(target = %entry.target, entry_type = %entry.entry_type, "Alarm programmed");
                Ok(Some(entry.target))
            }
            None => {
                self.alarm.delete_alarm().await?;
                Ok(None)
            }
        }
    }

    /// Every armed timer, sorted by (target, id).
    pub async fn active_entries(&self) -> Vec<TimerEntry> {
        let timers = self.timers.lock().await;
        let mut entries: Vec<TimerEntry> = timers
            .values()
            .filter_map(|state| match state {
                TimerState::Armed(entry) => Some(entry.clone()),
                TimerState::Settled => None,
            })
            .collect();
        entries.sort_by(|a, b| a.target.cmp(&b.target).then(a.id.cmp(&b.id)));
        entries
    }

    /// Target of the armed timer for (entry type, hash), if any.
    pub async fn active_target(
        &self,
        entry_type: TimerEntryType,
        hash: &str,
    ) -> Option<DateTime<Utc>> {
        let timers = self.timers.lock().await;
        match timers.get(&(entry_type, hash.to_string())) {
            Some(TimerState::Armed(entry)) => Some(entry.target),
            _ => None,
        }
    }
}

fn replay_row(row: TimerRecord) -> Result<(TimerKey, TimerState)> {
    let entry_type = TimerEntryType::from_code(row.entry_type).ok_or_else(|| {
        EngineError::SerializationError {
            details: format!("unknown timer entry type {}", row.entry_type),
        }
    })?;
    let action =
        TimerAction::from_code(row.action).ok_or_else(|| EngineError::SerializationError {
            details: format!("unknown timer action {}", row.action),
        })?;
    let target = DateTime::from_timestamp_millis(row.target_timestamp).ok_or_else(|| {
        EngineError::SerializationError {
            details: format!("timer target {} out of range", row.target_timestamp),
        }
    })?;

    let state = match action {
        TimerAction::Armed => TimerState::Armed(TimerEntry {
            id: row.id,
            entry_type,
            hash: row.hash.clone(),
            target,
        }),
        TimerAction::Tombstone => TimerState::Settled,
    };

    Ok(((entry_type, row.hash), state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::ManualAlarm;
    use crate::persistence::SqlitePersistence;
    use chrono::Duration;

    async fn test_store() -> (TimerStore, Arc<SqlitePersistence>, Arc<ManualAlarm>) {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        persistence.setup().await.unwrap();
        let alarm = Arc::new(ManualAlarm::new());
        let store = TimerStore::load(persistence.clone(), alarm.clone())
            .await
            .unwrap();
        (store, persistence, alarm)
    }

    #[test]
    fn test_hash_key_is_hex_sha256() {
        assert_eq!(
            hash_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash_key("a"), hash_key("a"));
        assert_ne!(hash_key("a"), hash_key("b"));
    }

    #[test]
    fn test_entry_type_codes() {
        for entry_type in [
            TimerEntryType::Sleep,
            TimerEntryType::Retry,
            TimerEntryType::Timeout,
            TimerEntryType::GracePeriod,
        ] {
            assert_eq!(TimerEntryType::from_code(entry_type.code()), Some(entry_type));
        }
        assert_eq!(TimerEntryType::from_code(7), None);
    }

    #[tokio::test]
    async fn test_schedule_duplicate_is_rejected() {
        let (store, _, _) = test_store().await;
        let target = Utc::now() + Duration::minutes(1);

        store
            .schedule(TimerEntryType::Sleep, "h", target)
            .await
            .unwrap();
        let err = store
            .schedule(TimerEntryType::Sleep, "h", target)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONSTRAINT_VIOLATION");
    }

    #[tokio::test]
    async fn test_cancelled_timer_is_not_popped() {
        let (store, _, _) = test_store().await;
        let now = Utc::now();

        store
            .schedule(TimerEntryType::Sleep, "a", now - Duration::seconds(5))
            .await
            .unwrap();
        store
            .schedule(TimerEntryType::Sleep, "b", now - Duration::seconds(5))
            .await
            .unwrap();
        assert!(store.cancel(TimerEntryType::Sleep, "a").await.unwrap());
        assert!(!store.cancel(TimerEntryType::Sleep, "a").await.unwrap());
        assert!(!store.cancel(TimerEntryType::Sleep, "missing").await.unwrap());

        let popped = store.pop_entries_due_at(now).await.unwrap();
        let hashes: Vec<&str> = popped.iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(hashes, vec!["b"]);
    }

    #[tokio::test]
    async fn test_pop_orders_by_target_then_id_and_consumes() {
        let (store, _, _) = test_store().await;
        let now = Utc::now();
        let same = now - Duration::seconds(10);

        store
            .schedule(TimerEntryType::Retry, "late", now - Duration::seconds(1))
            .await
            .unwrap();
        let first = store
            .schedule(TimerEntryType::Retry, "tie-1", same)
            .await
            .unwrap();
        let second = store
            .schedule(TimerEntryType::Timeout, "tie-2", same)
            .await
            .unwrap();
        store
            .schedule(TimerEntryType::Retry, "future", now + Duration::hours(1))
            .await
            .unwrap();
        assert!(first.id < second.id);

        let popped = store.pop_entries_due_at(now).await.unwrap();
        let hashes: Vec<&str> = popped.iter().map(|e| e.hash.as_str()).collect();
        assert_eq!(hashes, vec!["tie-1", "tie-2", "late"]);

        assert!(store.pop_entries_due_at(now).await.unwrap().is_empty());
        assert_eq!(store.active_entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_handle_next_alarm_tracks_earliest() {
        let (store, _, alarm) = test_store().await;
        let now = Utc::now();
        let early = now + Duration::seconds(10);
        let late = now + Duration::seconds(60);

        store
            .schedule(TimerEntryType::Sleep, "late", late)
            .await
            .unwrap();
        store
            .schedule(TimerEntryType::Sleep, "early", early)
            .await
            .unwrap();

        assert_eq!(store.handle_next_alarm().await.unwrap(), Some(early));
        assert_eq!(alarm.current(), Some(early));

        store.cancel(TimerEntryType::Sleep, "early").await.unwrap();
        store.handle_next_alarm().await.unwrap();
        assert_eq!(alarm.current(), Some(late));

        store.cancel(TimerEntryType::Sleep, "late").await.unwrap();
        assert_eq!(store.handle_next_alarm().await.unwrap(), None);
        assert_eq!(alarm.current(), None);
    }

    #[tokio::test]
    async fn test_rearm_after_cancel() {
        let (store, _, _) = test_store().await;
        let target = Utc::now() + Duration::minutes(5);

        store
            .schedule(TimerEntryType::GracePeriod, "g", target)
            .await
            .unwrap();
        store.cancel(TimerEntryType::GracePeriod, "g").await.unwrap();

        let rearmed = store
            .schedule(TimerEntryType::GracePeriod, "g", target)
            .await
            .unwrap();
        assert_eq!(
            store.active_target(TimerEntryType::GracePeriod, "g").await,
            Some(target)
        );

        store.cancel(TimerEntryType::GracePeriod, "g").await.unwrap();
        let again = store
            .schedule(TimerEntryType::GracePeriod, "g", target)
            .await
            .unwrap();
        assert!(again.id > rearmed.id);
    }

    #[tokio::test]
    async fn test_load_replays_rows() {
        let (store, persistence, alarm) = test_store().await;
        let target = Utc::now() + Duration::minutes(1);

        store
            .schedule(TimerEntryType::Sleep, "kept", target)
            .await
            .unwrap();
        store
            .schedule(TimerEntryType::Sleep, "cancelled", target)
            .await
            .unwrap();
        store
            .cancel(TimerEntryType::Sleep, "cancelled")
            .await
            .unwrap();
        drop(store);

        let reloaded = TimerStore::load(persistence, alarm).await.unwrap();
        let active = reloaded.active_entries().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].hash, "kept");
        assert_eq!(
            active[0].target.timestamp_millis(),
            target.timestamp_millis()
        );

        let err = reloaded
            .schedule(TimerEntryType::Sleep, "kept", target)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONSTRAINT_VIOLATION");
        reloaded
            .schedule(TimerEntryType::Sleep, "cancelled", target)
            .await
            .unwrap();
    }
}
