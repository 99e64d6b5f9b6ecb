//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::{EngineError, Result};
use crate::instance::{
    ENGINE_STATUS_KEY, INSTANCE_METADATA_KEY, InstanceEvent, InstanceStatus, LogEntry, LogRecord,
};
use crate::timers::TimerEntryType;

use super::{Persistence, TimerAction, TimerRecord};

/// Schema statements, applied in one transaction by [`SqlitePersistence::setup`].
const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS priority_queue (
        id INTEGER PRIMARY KEY NOT NULL,
        created_on TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        target_timestamp INTEGER NOT NULL,
        action INTEGER NOT NULL,
        entryType INTEGER NOT NULL,
        hash TEXT NOT NULL,
        CHECK (action IN (0, 1)),
        UNIQUE (action, entryType, hash)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS states (
        id INTEGER PRIMARY KEY NOT NULL,
        created_on TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        groupKey TEXT,
        target TEXT,
        metadata TEXT,
        event INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS kv_store (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )
    "#,
];

/// Raw log row; converted into a [`LogRecord`] on read.
#[derive(Debug, sqlx::FromRow)]
struct LogRow {
    id: i64,
    created_on: DateTime<Utc>,
    group_key: Option<String>,
    target: Option<String>,
    event: i64,
    metadata: Option<String>,
}

impl TryFrom<LogRow> for LogRecord {
    type Error = EngineError;

    fn try_from(row: LogRow) -> Result<Self> {
        let event =
            InstanceEvent::from_code(row.event).ok_or_else(|| EngineError::SerializationError {
                details: format!("unknown log event code {}", row.event),
            })?;
        let metadata = match row.metadata {
            Some(raw) => serde_json::from_str(&raw)?,
            None => Value::Null,
        };

        Ok(LogRecord {
            id: row.id,
            created_on: row.created_on,
            event,
            group: row.group_key,
            target: row.target,
            metadata,
        })
    }
}

/// SQLite-backed persistence provider.
///
/// One database holds the state of one engine actor: the key-value store,
/// the log, and the timer rows.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a database file.
    ///
    /// Parent directories are created when missing. The schema is not applied
    /// here; the engine applies it behind its startup barrier, or call
    /// [`Persistence::setup`] directly.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect to a SQLite URL such as `sqlite:data/engine.db?mode=rwc`.
    ///
    /// `sqlite::memory:` is routed to [`SqlitePersistence::in_memory`], since
    /// every pooled connection would otherwise see its own empty database.
    pub async fn connect(url: &str) -> Result<Self> {
        if url == "sqlite::memory:" {
            return Self::in_memory().await;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        Ok(Self { pool })
    }

    /// Private in-memory database, kept alive on a single connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| EngineError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `substr` comparison rather than `LIKE`, so `%` and `_` in keys are literal.
const PREFIX_FILTER: &str = "substr(key, 1, length(?1)) = ?1";

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn setup(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| EngineError::DatabaseError {
                    operation: "setup".to_string(),
                    details: e.to_string(),
                })?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn health_check_db(&self) -> Result<bool> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }

    async fn get_value(&self, key: &str) -> Result<Option<Value>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some((raw,)) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_value(&self, key: &str, value: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_values(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(&format!(
            "SELECT key, value FROM kv_store WHERE {} ORDER BY key ASC",
            PREFIX_FILTER
        ))
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, raw)| Ok((key, serde_json::from_str(&raw)?)))
            .collect()
    }

    async fn replace_prefix(&self, prefix: &str, entries: &[(String, Value)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!("DELETE FROM kv_store WHERE {}", PREFIX_FILTER))
            .bind(prefix)
            .execute(&mut *tx)
            .await?;

        for (key, value) in entries {
            sqlx::query("INSERT INTO kv_store (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(serde_json::to_string(value)?)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO states (event, groupKey, target, metadata)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(entry.event.code())
        .bind(entry.group.as_deref())
        .bind(entry.target.as_deref())
        .bind(serde_json::to_string(&entry.metadata)?)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn read_logs(&self) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, created_on, groupKey AS group_key, target, event, metadata
            FROM states
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LogRecord::try_from).collect()
    }

    async fn record_first_start(&self, metadata: &Value, logs: &[LogEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO kv_store (key, value) VALUES (?, ?)")
            .bind(INSTANCE_METADATA_KEY)
            .bind(serde_json::to_string(metadata)?)
            .execute(&mut *tx)
            .await?;

        for entry in logs {
            sqlx::query(
                r#"
                INSERT INTO states (event, groupKey, target, metadata)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(entry.event.code())
            .bind(entry.group.as_deref())
            .bind(entry.target.as_deref())
            .bind(serde_json::to_string(&entry.metadata)?)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn commit_transition(
        &self,
        status: InstanceStatus,
        log: Option<&LogEntry>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let stored: Option<(String,)> =
            sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
                .bind(ENGINE_STATUS_KEY)
                .fetch_optional(&mut *tx)
                .await?;
        let current = match stored {
            Some((value,)) => serde_json::from_str::<InstanceStatus>(&value)?,
            None => InstanceStatus::Queued,
        };
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }

        if let Some(entry) = log {
            sqlx::query(
                r#"
                INSERT INTO states (event, groupKey, target, metadata)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(entry.event.code())
            .bind(entry.group.as_deref())
            .bind(entry.target.as_deref())
            .bind(serde_json::to_string(&entry.metadata)?)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value)
            VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(ENGINE_STATUS_KEY)
        .bind(serde_json::to_string(&status)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_armed_timer(
        &self,
        entry_type: TimerEntryType,
        hash: &str,
        target: DateTime<Utc>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO priority_queue (target_timestamp, action, entryType, hash)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(target.timestamp_millis())
        .bind(TimerAction::Armed.code())
        .bind(entry_type.code())
        .bind(hash)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                EngineError::ConstraintViolation {
                    entry_type: entry_type.as_str().to_string(),
                    hash: hash.to_string(),
                }
            }
            other => other.into(),
        })?;

        Ok(result.last_insert_rowid())
    }

    async fn rearm_timer(
        &self,
        entry_type: TimerEntryType,
        hash: &str,
        target: DateTime<Utc>,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM priority_queue WHERE entryType = ? AND hash = ?")
            .bind(entry_type.code())
            .bind(hash)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query(
            r#"
            INSERT INTO priority_queue (target_timestamp, action, entryType, hash)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(target.timestamp_millis())
        .bind(TimerAction::Armed.code())
        .bind(entry_type.code())
        .bind(hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(result.last_insert_rowid())
    }

    async fn insert_tombstones(
        &self,
        timers: &[(TimerEntryType, String, DateTime<Utc>)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for (entry_type, hash, target) in timers {
            sqlx::query(
                r#"
                INSERT INTO priority_queue (target_timestamp, action, entryType, hash)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(action, entryType, hash) DO NOTHING
                "#,
            )
            .bind(target.timestamp_millis())
            .bind(TimerAction::Tombstone.code())
            .bind(entry_type.code())
            .bind(hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_timer_rows(&self) -> Result<Vec<TimerRecord>> {
        let rows = sqlx::query_as::<_, TimerRecord>(
            r#"
            SELECT id, created_on, target_timestamp, action, entryType AS entry_type, hash
            FROM priority_queue
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Create an in-memory SQLite persistence with the schema applied.
    async fn test_persistence() -> SqlitePersistence {
        let persistence = SqlitePersistence::in_memory()
            .await
            .expect("Failed to create in-memory SQLite pool");
        persistence.setup().await.expect("Failed to create schema");
        persistence
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let persistence = test_persistence().await;
        persistence.setup().await.expect("Second setup should succeed");
        assert!(persistence.health_check_db().await.unwrap());
    }

    #[tokio::test]
    async fn test_put_and_get_value() {
        let persistence = test_persistence().await;

        assert!(persistence.get_value("missing").await.unwrap().is_none());

        persistence.put_value("k", &json!({"a": 1})).await.unwrap();
        persistence.put_value("k", &json!({"a": 2})).await.unwrap();

        let value = persistence.get_value("k").await.unwrap();
        assert_eq!(value, Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_list_values_returns_ascending_keys_under_prefix() {
        let persistence = test_persistence().await;

        persistence.put_value("P\nb", &json!(2)).await.unwrap();
        persistence.put_value("P\na", &json!(1)).await.unwrap();
        persistence.put_value("Q\na", &json!(3)).await.unwrap();
        persistence.put_value("P_x", &json!(4)).await.unwrap();

        let entries = persistence.list_values("P\n").await.unwrap();
        let keys: Vec<&str> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["P\na", "P\nb"]);
    }

    #[tokio::test]
    async fn test_prefix_is_matched_literally() {
        let persistence = test_persistence().await;

        persistence.put_value("a%b", &json!(1)).await.unwrap();
        persistence.put_value("axb", &json!(2)).await.unwrap();

        let entries = persistence.list_values("a%").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "a%b");
    }

    #[tokio::test]
    async fn test_replace_prefix_overwrites_whole_prefix() {
        let persistence = test_persistence().await;

        persistence.put_value("M\n1", &json!("old-1")).await.unwrap();
        persistence.put_value("M\n2", &json!("old-2")).await.unwrap();
        persistence.put_value("other", &json!("kept")).await.unwrap();

        persistence
            .replace_prefix("M\n", &[("M\n1".to_string(), json!("new-1"))])
            .await
            .unwrap();

        let entries = persistence.list_values("M\n").await.unwrap();
        assert_eq!(entries, vec![("M\n1".to_string(), json!("new-1"))]);
        assert_eq!(
            persistence.get_value("other").await.unwrap(),
            Some(json!("kept"))
        );
    }

    #[tokio::test]
    async fn test_append_and_read_logs_in_id_order() {
        let persistence = test_persistence().await;

        let first = persistence
            .append_log(&LogEntry::new(InstanceEvent::WorkflowQueued, json!({"p": 1})))
            .await
            .unwrap();
        let second = persistence
            .append_log(
                &LogEntry::new(InstanceEvent::StepStart, json!({}))
                    .with_group("step-a")
                    .with_target("fetch"),
            )
            .await
            .unwrap();
        assert!(second > first);

        let logs = persistence.read_logs().await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].event, InstanceEvent::WorkflowQueued);
        assert_eq!(logs[0].metadata, json!({"p": 1}));
        assert_eq!(logs[0].group, None);
        assert_eq!(logs[1].group.as_deref(), Some("step-a"));
        assert_eq!(logs[1].target.as_deref(), Some("fetch"));
    }

    #[tokio::test]
    async fn test_commit_transition_writes_status_and_log() {
        let persistence = test_persistence().await;

        persistence
            .commit_transition(
                InstanceStatus::Errored,
                Some(&LogEntry::new(
                    InstanceEvent::WorkflowFailure,
                    json!({"error": {"name": "Error", "message": "boom"}}),
                )),
            )
            .await
            .unwrap();

        assert_eq!(
            persistence.get_value(ENGINE_STATUS_KEY).await.unwrap(),
            Some(json!("errored"))
        );
        let logs = persistence.read_logs().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, InstanceEvent::WorkflowFailure);
    }

    #[tokio::test]
    async fn test_commit_transition_refuses_to_leave_terminal_status() {
        let persistence = test_persistence().await;
        persistence
            .commit_transition(InstanceStatus::Running, None)
            .await
            .unwrap();
        persistence
            .commit_transition(
                InstanceStatus::Terminated,
                Some(&LogEntry::new(InstanceEvent::WorkflowTerminated, json!({}))),
            )
            .await
            .unwrap();

        let err = persistence
            .commit_transition(
                InstanceStatus::Complete,
                Some(&LogEntry::new(InstanceEvent::WorkflowSuccess, json!({}))),
            )
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        assert_eq!(
            persistence.get_value(ENGINE_STATUS_KEY).await.unwrap(),
            Some(json!("terminated"))
        );
        // The refused log entry was rolled back with the status write.
        let logs = persistence.read_logs().await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].event, InstanceEvent::WorkflowTerminated);
    }

    #[tokio::test]
    async fn test_commit_transition_refuses_to_move_backwards() {
        let persistence = test_persistence().await;
        persistence
            .commit_transition(InstanceStatus::Running, None)
            .await
            .unwrap();

        let err = persistence
            .commit_transition(InstanceStatus::Queued, None)
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "INVALID_TRANSITION");
        assert_eq!(
            persistence.get_value(ENGINE_STATUS_KEY).await.unwrap(),
            Some(json!("running"))
        );
    }

    #[tokio::test]
    async fn test_record_first_start_rejects_second_metadata() {
        let persistence = test_persistence().await;

        let logs = [LogEntry::new(InstanceEvent::WorkflowQueued, json!({}))];
        persistence
            .record_first_start(&json!({"account_id": 1}), &logs)
            .await
            .unwrap();

        let result = persistence
            .record_first_start(&json!({"account_id": 2}), &logs)
            .await;
        assert!(result.is_err());

        // The failed transaction left neither the metadata nor its log behind.
        assert_eq!(
            persistence.get_value(INSTANCE_METADATA_KEY).await.unwrap(),
            Some(json!({"account_id": 1}))
        );
        assert_eq!(persistence.read_logs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_armed_timer_is_constraint_violation() {
        let persistence = test_persistence().await;
        let target = Utc::now();

        persistence
            .insert_armed_timer(TimerEntryType::Sleep, "h1", target)
            .await
            .unwrap();
        let err = persistence
            .insert_armed_timer(TimerEntryType::Sleep, "h1", target)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONSTRAINT_VIOLATION");

        // Same hash under another entry type is a different logical timer.
        persistence
            .insert_armed_timer(TimerEntryType::Retry, "h1", target)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tombstones_and_rearm() {
        let persistence = test_persistence().await;
        let target = Utc::now();

        persistence
            .insert_armed_timer(TimerEntryType::Timeout, "h", target)
            .await
            .unwrap();
        let tombstone = vec![(TimerEntryType::Timeout, "h".to_string(), target)];
        persistence.insert_tombstones(&tombstone).await.unwrap();
        persistence.insert_tombstones(&tombstone).await.unwrap();

        let rows = persistence.list_timer_rows().await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, TimerAction::Armed.code());
        assert_eq!(rows[1].action, TimerAction::Tombstone.code());
        assert_eq!(rows[1].entry_type, TimerEntryType::Timeout.code());

        let id = persistence
            .rearm_timer(TimerEntryType::Timeout, "h", target)
            .await
            .unwrap();
        let rows = persistence.list_timer_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].action, TimerAction::Armed.code());
    }
}
