//! Persistence interfaces and backends for runtara-engine.
//!
//! The engine needs three things from its host storage: a key-value store with
//! ordered prefix scans, an append-only log table, and the timer table with its
//! uniqueness constraint. All three live in one backend so a single transaction
//! can span them.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::instance::{InstanceStatus, LogEntry, LogRecord};
use crate::timers::TimerEntryType;

/// Action stored in a timer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// The row cancels the logical timer.
    Tombstone,
    /// The row arms the logical timer.
    Armed,
}

impl TimerAction {
    /// Integer code stored in the `action` column.
    pub fn code(&self) -> i64 {
        match self {
            Self::Tombstone => 0,
            Self::Armed => 1,
        }
    }

    /// Parse a stored code.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Tombstone),
            1 => Some(Self::Armed),
            _ => None,
        }
    }
}

/// Timer row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TimerRecord {
    /// Database primary key; insertion order.
    pub id: i64,
    /// When the row was written.
    pub created_on: DateTime<Utc>,
    /// Target wake time in epoch milliseconds.
    pub target_timestamp: i64,
    /// Raw [`TimerAction`] code.
    pub action: i64,
    /// Raw [`TimerEntryType`] code.
    pub entry_type: i64,
    /// Content hash of the logical timer.
    pub hash: String,
}

/// Persistence interface used by the engine.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Create the schema if it does not exist. Idempotent.
    async fn setup(&self) -> Result<()>;

    /// Cheap liveness query.
    async fn health_check_db(&self) -> Result<bool>;

    // ========================================================================
    // Key-value store
    // ========================================================================

    /// Read one JSON value.
    async fn get_value(&self, key: &str) -> Result<Option<Value>>;

    /// Write one JSON value, replacing any previous one.
    async fn put_value(&self, key: &str, value: &Value) -> Result<()>;

    /// List every entry whose key starts with `prefix`, in ascending key order.
    async fn list_values(&self, prefix: &str) -> Result<Vec<(String, Value)>>;

    /// Atomically drop every key under `prefix` and write `entries` instead.
    async fn replace_prefix(&self, prefix: &str, entries: &[(String, Value)]) -> Result<()>;

    // ========================================================================
    // Durable log
    // ========================================================================

    /// Append a log entry and return its ID.
    async fn append_log(&self, entry: &LogEntry) -> Result<i64>;

    /// Read the whole log in ID order.
    async fn read_logs(&self) -> Result<Vec<LogRecord>>;

    /// Write the instance metadata together with the first log entries, in one
    /// transaction.
    async fn record_first_start(&self, metadata: &Value, logs: &[LogEntry]) -> Result<()>;

    /// Write the status and, optionally, a log entry in one transaction.
    ///
    /// The stored status is checked inside the same transaction: leaving a
    /// terminal status or moving backwards fails with `InvalidTransition` and
    /// writes nothing.
    async fn commit_transition(&self, status: InstanceStatus, log: Option<&LogEntry>)
    -> Result<()>;

    // ========================================================================
    // Timer rows
    // ========================================================================

    /// Append an armed row.
    ///
    /// Fails with `ConstraintViolation` if an armed row for the same
    /// (entry type, hash) exists.
    async fn insert_armed_timer(
        &self,
        entry_type: TimerEntryType,
        hash: &str,
        target: DateTime<Utc>,
    ) -> Result<i64>;

    /// Drop the settled rows of a cancelled logical timer and append a fresh
    /// armed row, in one transaction.
    ///
    /// The unique (action, entry type, hash) constraint leaves no room for a
    /// second armed/tombstone pair, so the history of the earlier arming is
    /// lost: only the fresh armed row remains for this timer.
    async fn rearm_timer(
        &self,
        entry_type: TimerEntryType,
        hash: &str,
        target: DateTime<Utc>,
    ) -> Result<i64>;

    /// Append tombstone rows in one transaction. Timers that already carry a
    /// tombstone are skipped.
    async fn insert_tombstones(&self, timers: &[(TimerEntryType, String, DateTime<Utc>)])
    -> Result<()>;

    /// All timer rows in insertion order.
    async fn list_timer_rows(&self) -> Result<Vec<TimerRecord>>;
}
